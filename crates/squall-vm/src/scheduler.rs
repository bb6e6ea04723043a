//! Single-worker job scheduler.
//!
//! The scheduler owns the only interpreter of a VM and the thread it lives
//! on. Every interaction with the interpreter is a [`Job`] pushed onto a
//! bounded queue and executed, in order, by that worker.
//!
//! Each `start` opens a new *generation*: a fresh interpreter, a fresh worker
//! thread and a fresh done [`Signal`]. Jobs are tagged with the generation
//! they were submitted for, and anything left over from an older generation
//! is dropped without running.
//!
//! ```text
//!  callers / timers / pollers
//!            │  JobSender::submit
//!            ↓
//!  ┌───────────────────────┐      ┌────────────────────────────┐
//!  │ bounded queue (256)   │ ───→ │ worker "squall-vm-N"       │
//!  └───────────────────────┘      │  job → pending jobs → done?│
//!                                 └────────────────────────────┘
//! ```

use crate::config::VmConfig;
use crate::console;
use crate::error::{VmError, VmResult};
use crate::interpreter::{InterruptState, Interpreter};
use crate::modules::Registry;
use crate::signal::Signal;
use crate::timers;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info_span, trace, warn};

/// A unit of work executed on the worker thread.
pub type Job = Box<dyn FnOnce(&Interpreter) + Send + 'static>;

/// Callback run once per generation, after the built-in globals are installed.
pub type InitHook = Arc<dyn Fn(&Interpreter) -> VmResult<()> + Send + Sync + 'static>;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True when called from a scheduler worker thread.
pub(crate) fn in_worker() -> bool {
    IN_WORKER.with(|w| w.get())
}

struct Envelope {
    generation: u64,
    job: Job,
}

/// Statistics about scheduler operation
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Jobs accepted onto the queue
    pub jobs_submitted: AtomicU64,
    /// Jobs that ran to completion (including ones whose script failed)
    pub jobs_executed: AtomicU64,
    /// Jobs dropped without running: submitted to a finished generation,
    /// drained during shutdown, or left over from an older generation
    pub jobs_discarded: AtomicU64,
    /// Jobs that panicked
    pub jobs_panicked: AtomicU64,
}

impl SchedulerStats {
    /// Get snapshot of current stats
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_discarded: self.jobs_discarded.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of scheduler statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_executed: u64,
    pub jobs_discarded: u64,
    pub jobs_panicked: u64,
}

/// Submission handle bound to one generation.
///
/// Once the generation ends every submission is discarded, so holders such
/// as timer threads can never reach a newer interpreter.
#[derive(Clone)]
pub struct JobSender {
    tx: Sender<Envelope>,
    generation: u64,
    done: Signal,
    stats: Arc<SchedulerStats>,
}

impl JobSender {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Closed when the generation ends.
    pub fn done(&self) -> &Signal {
        &self.done
    }

    /// Queue a job. Returns `false` when the job was discarded.
    ///
    /// Blocks while the queue is full, unless called from the worker itself:
    /// the worker never waits on its own queue, so an overflowing submission
    /// from inside a job is handed to a short-lived thread instead.
    pub fn submit(&self, job: Job) -> bool {
        if self.done.is_closed() {
            self.stats.jobs_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(generation = self.generation, "VM not running, discarding job");
            return false;
        }

        let envelope = Envelope {
            generation: self.generation,
            job,
        };
        if !in_worker() {
            return self.send_blocking(envelope);
        }

        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(envelope)) => {
                let sender = self.clone();
                let spawned = std::thread::Builder::new()
                    .name("squall-vm-overflow".to_string())
                    .spawn(move || {
                        sender.send_blocking(envelope);
                    });
                match spawned {
                    Ok(_) => true,
                    Err(e) => {
                        self.stats.jobs_discarded.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "Failed to spawn overflow thread, discarding job");
                        false
                    }
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.jobs_discarded.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn send_blocking(&self, envelope: Envelope) -> bool {
        let sent = select! {
            send(self.tx, envelope) -> res => res.is_ok(),
            recv(self.done.receiver()) -> _ => false,
        };
        if sent {
            self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.jobs_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(generation = self.generation, "Generation ended while queueing job");
        }
        sent
    }
}

struct SchedulerState {
    running: bool,
    generation: u64,
    done: Signal,
    interrupt: Arc<InterruptState>,
    worker: Option<JoinHandle<()>>,
}

/// Owns the interpreter and the worker thread driving it.
pub struct Scheduler {
    config: VmConfig,
    registry: Arc<Registry>,
    hooks: Arc<Mutex<Vec<InitHook>>>,
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    state: Arc<Mutex<SchedulerState>>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(config: VmConfig, registry: Arc<Registry>) -> Self {
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        Self {
            config,
            registry,
            hooks: Arc::new(Mutex::new(Vec::new())),
            tx,
            rx,
            state: Arc::new(Mutex::new(SchedulerState {
                running: false,
                generation: 0,
                done: Signal::closed(),
                interrupt: Arc::new(InterruptState::default()),
                worker: None,
            })),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Add a hook that runs after the existing ones on every new interpreter.
    pub fn on_runtime_init(&self, hook: InitHook) {
        self.hooks.lock().push(hook);
    }

    /// Add a hook that runs before the existing ones on every new interpreter.
    pub fn prepend_runtime_init(&self, hook: InitHook) {
        self.hooks.lock().insert(0, hook);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Current generation number; 0 before the first start.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Submission handle for the current generation. When the scheduler is
    /// not running the handle discards everything it is given.
    pub fn sender(&self) -> JobSender {
        let state = self.state.lock();
        self.sender_for(&state)
    }

    fn sender_for(&self, state: &SchedulerState) -> JobSender {
        JobSender {
            tx: self.tx.clone(),
            generation: state.generation,
            done: state.done.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Queue a job on the current generation.
    pub fn run(&self, job: Job) -> bool {
        let sender = self.sender();
        if sender.done().is_closed() {
            warn!("VM is not running, discarding job");
        }
        sender.submit(job)
    }

    /// Start a new generation.
    pub fn start(&self) -> VmResult<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(VmError::AlreadyRunning);
        }

        if let Some(worker) = state.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!(
                    generation = state.generation,
                    "Previous worker is still busy, detaching it"
                );
            }
        }
        self.drain();

        let generation = state.generation + 1;
        let done = Signal::new();
        let interrupt = Arc::new(InterruptState::default());

        let (ready_tx, ready_rx) = bounded::<VmResult<()>>(1);
        let worker = {
            let rx = self.rx.clone();
            let done = done.clone();
            let interrupt = interrupt.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            std::thread::Builder::new()
                .name(format!("squall-vm-{generation}"))
                .spawn(move || {
                    let interpreter = match Interpreter::new(generation, interrupt, &config) {
                        Ok(interpreter) => {
                            let _ = ready_tx.send(Ok(()));
                            interpreter
                        }
                        Err(e) => {
                            error!(error = %e, generation, "Failed to create interpreter");
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    run_worker(interpreter, rx, done, stats);
                })
                .map_err(|e| VmError::internal(format!("Failed to spawn worker: {e}")))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(VmError::internal("worker exited during startup"));
            }
        }

        state.running = true;
        state.generation = generation;
        state.done = done;
        state.interrupt = interrupt;
        state.worker = Some(worker);

        // The lock is still held, so nothing can be queued on this generation
        // ahead of the init job.
        let sender = self.sender_for(&state);
        let init = self.init_job(sender.clone());
        if !sender.submit(init) {
            warn!(generation, "Failed to queue interpreter initialization");
        }

        debug!(generation, "VM started");
        Ok(())
    }

    fn init_job(&self, sender: JobSender) -> Job {
        let registry = self.registry.clone();
        let hooks = self.hooks.clone();
        Box::new(move |interpreter: &Interpreter| {
            let _span = info_span!("init", generation = interpreter.generation()).entered();

            if let Err(e) = registry.enable(interpreter) {
                warn!(error = %e, "Failed to enable require");
            }
            let builtins = interpreter.with(|ctx| -> VmResult<()> {
                console::register_console(&ctx)?;
                timers::install(&ctx, sender)?;
                Ok(())
            });
            if let Err(e) = builtins {
                warn!(error = %e, "Failed to install built-in globals");
            }

            let hooks = hooks.lock().clone();
            for hook in hooks {
                if let Err(e) = execute_with_panic_handler(|| hook(interpreter)) {
                    warn!(error = %e, "Runtime init hook failed");
                }
            }
        })
    }

    /// Stop the current generation.
    ///
    /// Waits for the queue to reach the stop job. After the soft timeout the
    /// queue is drained, running script is interrupted and the stop job is
    /// queued again; after the hard timeout the stop is abandoned.
    pub fn stop(&self) -> VmResult<()> {
        if in_worker() {
            return Err(VmError::internal("cannot stop the VM from inside a job"));
        }

        let (sender, interrupt) = {
            let state = self.state.lock();
            if !state.running {
                return Err(VmError::NotRunning);
            }
            (self.sender_for(&state), state.interrupt.clone())
        };
        let generation = sender.generation();
        let done = sender.done().clone();

        let stop_job = || -> Envelope {
            let state = self.state.clone();
            let done = done.clone();
            Envelope {
                generation,
                job: Box::new(move |_: &Interpreter| {
                    let mut state = state.lock();
                    if state.generation == generation {
                        state.running = false;
                    }
                    // No job of this generation runs after this point.
                    done.close();
                }),
            }
        };

        self.enqueue_control(stop_job(), self.config.soft_timeout);
        if done.wait_timeout(self.config.soft_timeout) {
            return self.finish_stop(generation);
        }

        warn!(
            generation,
            "VM soft timeout expired, flushing remaining jobs without running them"
        );
        self.drain();
        interrupt.request("vm is shutting down");
        self.enqueue_control(stop_job(), self.config.hard_timeout);

        if done.wait_timeout(self.config.hard_timeout) {
            return self.finish_stop(generation);
        }
        error!(generation, "VM hard timeout expired, giving up");
        Err(VmError::ShutdownTimeout)
    }

    fn enqueue_control(&self, envelope: Envelope, timeout: Duration) {
        match self.tx.send_timeout(envelope, timeout) {
            Ok(()) => {
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => warn!("Timed out queueing stop job"),
        }
    }

    fn finish_stop(&self, generation: u64) -> VmResult<()> {
        let worker = self.state.lock().worker.take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!(generation, "Worker thread panicked");
            }
        }
        debug!(generation, "VM stopped");
        Ok(())
    }

    /// Ask the interpreter to abort what it is running. No-op when stopped.
    pub fn interrupt(&self, reason: impl Into<String>) {
        let state = self.state.lock();
        if !state.running {
            return;
        }
        state.interrupt.request(reason);
    }

    /// Discard every queued job without running it.
    fn drain(&self) {
        let mut drained = 0u64;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            self.stats
                .jobs_discarded
                .fetch_add(drained, Ordering::Relaxed);
            debug!(drained, "Drained job queue");
        }
    }
}

/// Worker loop: runs jobs of one generation until its done signal closes.
fn run_worker(
    interpreter: Interpreter,
    rx: Receiver<Envelope>,
    done: Signal,
    stats: Arc<SchedulerStats>,
) {
    IN_WORKER.with(|w| w.set(true));
    let generation = interpreter.generation();
    let _span = info_span!("worker", generation).entered();
    debug!("Worker starting");

    while !done.is_closed() {
        let envelope = select! {
            recv(done.receiver()) -> _ => None,
            recv(rx) -> msg => msg.ok(),
        };
        let Some(envelope) = envelope else {
            break;
        };
        if envelope.generation != generation {
            stats.jobs_discarded.fetch_add(1, Ordering::Relaxed);
            trace!(job_generation = envelope.generation, "Discarding stale job");
            continue;
        }

        let job = envelope.job;
        interpreter.reset_interrupt();
        match catch_unwind(AssertUnwindSafe(|| job(&interpreter))) {
            Ok(()) => {
                stats.jobs_executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                stats.jobs_panicked.fetch_add(1, Ordering::Relaxed);
                error!("Job panicked: {}", panic_message(panic.as_ref()));
            }
        }
        interpreter.run_pending_jobs();
    }

    debug!("Worker shutting down");
}

/// Execute a closure with panic handling
pub(crate) fn execute_with_panic_handler<T, F>(f: F) -> VmResult<T>
where
    F: FnOnce() -> VmResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = format!("Worker panic: {}", panic_message(panic.as_ref()));
            error!("{}", message);
            Err(VmError::internal(message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown error".to_string()
    }
}
