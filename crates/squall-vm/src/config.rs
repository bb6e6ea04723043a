//! Configuration for the VM.
//!
//! `VmConfig` carries the knobs of the scheduler, the async result poller and
//! the module registry. It is a plain builder-style struct; reading it from a
//! file is left to whoever embeds the VM.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for a [`Vm`](crate::Vm).
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Base directory for module resolution. A trailing `node_modules`
    /// component is stripped; bare specifiers resolve under
    /// `<modules_path>/node_modules`.
    /// Default: current directory
    pub modules_path: PathBuf,

    /// Capacity of the bounded job queue.
    /// Default: 256
    pub queue_capacity: usize,

    /// How long `stop` waits before draining the queue and interrupting.
    /// Default: 500ms
    pub soft_timeout: Duration,

    /// How long `stop` waits after the soft timeout before giving up.
    /// Default: 1s
    pub hard_timeout: Duration,

    /// First delay between async result checks.
    /// Default: 10µs
    pub poll_initial_delay: Duration,

    /// Ceiling for the async result check delay.
    /// Default: 100ms
    pub poll_max_delay: Duration,

    /// Interpreter heap limit in bytes.
    pub memory_limit: Option<usize>,

    /// Interpreter stack limit in bytes.
    pub max_stack_size: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            modules_path: PathBuf::from("."),
            queue_capacity: 256,
            soft_timeout: Duration::from_millis(500),
            hard_timeout: Duration::from_secs(1),
            poll_initial_delay: Duration::from_micros(10),
            poll_max_delay: Duration::from_millis(100),
            memory_limit: None,
            max_stack_size: None,
        }
    }
}

impl VmConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the module base path.
    pub fn modules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.modules_path = path.into();
        self
    }

    /// Set the job queue capacity (at least 1).
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the soft and hard shutdown timeouts.
    pub fn shutdown_timeouts(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_timeout = soft;
        self.hard_timeout = hard;
        self
    }

    /// Set the async result backoff window.
    pub fn poll_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial_delay = initial;
        self.poll_max_delay = max.max(initial);
        self
    }

    /// Limit the interpreter heap.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Limit the interpreter stack.
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }
}

/// Backoff parameters handed to each async result.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl PollBackoff {
    /// Delay to use after `current`: ten times longer, capped at `max`.
    pub fn next(&self, current: Duration) -> Duration {
        if current < self.max {
            (current * 10).min(self.max)
        } else {
            self.max
        }
    }
}

impl From<&VmConfig> for PollBackoff {
    fn from(config: &VmConfig) -> Self {
        Self {
            initial: config.poll_initial_delay,
            max: config.poll_max_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.soft_timeout, Duration::from_millis(500));
        assert_eq!(config.hard_timeout, Duration::from_secs(1));
        assert!(config.memory_limit.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let config = VmConfig::new()
            .modules_path("/srv/scripts")
            .queue_capacity(0)
            .memory_limit(1 << 20);

        assert_eq!(config.modules_path, PathBuf::from("/srv/scripts"));
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.memory_limit, Some(1 << 20));
    }

    #[test]
    fn test_backoff_grows_to_ceiling() {
        let backoff = PollBackoff::from(&VmConfig::default());
        let mut delay = backoff.initial;
        let mut seen = vec![];
        for _ in 0..6 {
            delay = backoff.next(delay);
            seen.push(delay);
        }
        assert_eq!(seen[0], Duration::from_micros(100));
        assert_eq!(seen[1], Duration::from_millis(1));
        assert_eq!(seen[3], Duration::from_millis(100));
        assert_eq!(seen[5], Duration::from_millis(100));
    }
}
