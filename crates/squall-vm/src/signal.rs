//! One-shot broadcast signal.
//!
//! A `Signal` is a channel nobody ever sends on: closing it drops the only
//! sender, which wakes every receiver at once and keeps them woken. That makes
//! it usable as an arm of `crossbeam_channel::select!`, the same way the
//! worker selects between its job queue and its generation's done signal.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(SignalInner {
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// A signal that is already closed.
    pub fn closed() -> Self {
        let signal = Self::new();
        signal.close();
        signal
    }

    /// Close the signal. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.inner.tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes ready (with an error) once the signal closes.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    /// Block until the signal closes.
    pub fn wait(&self) {
        let _ = self.inner.rx.recv();
    }

    /// Block until the signal closes or `timeout` elapses. Returns whether the
    /// signal is closed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.inner.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_close_is_one_shot() {
        let signal = Signal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[test]
    fn test_wait_timeout_reports_state() {
        let signal = Signal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        signal.close();
        assert!(signal.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_close_wakes_all_waiters() {
        let signal = Signal::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let s = signal.clone();
                thread::spawn(move || s.wait())
            })
            .collect();
        signal.close();
        for w in waiters {
            w.join().unwrap();
        }
    }
}
