//! Error types for squall-vm
//!
//! Every failure that can reach a caller is a [`VmError`]. Errors raised inside
//! the interpreter (script exceptions, require failures, interrupts) are caught
//! at the job boundary and converted here, so nothing unwinds across the worker.

use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while driving the VM
#[derive(Error, Debug, Clone)]
pub enum VmError {
    /// `start` was called on a running scheduler
    #[error("already started")]
    AlreadyRunning,

    /// `stop` was called on a scheduler that is not running
    #[error("not started")]
    NotRunning,

    /// The stop job did not run before the hard timeout expired
    #[error("timed out waiting to stop")]
    ShutdownTimeout,

    /// The result was cancelled or its generation ended before it resolved
    #[error("execution cancelled")]
    Cancelled,

    /// Execution was aborted through the interpreter's interrupt hook
    #[error("execution interrupted: {0}")]
    Interrupted(String),

    /// Source failed to parse
    #[error("SyntaxError: {message} ({file}:{line})")]
    Syntax {
        file: String,
        line: usize,
        message: String,
    },

    /// The source transform rejected its input
    #[error("transform failed: {0}")]
    Transform(String),

    /// An exception thrown by script code
    #[error("{name}: {message}")]
    Script {
        name: String,
        message: String,
        stack: Option<String>,
    },

    /// A require specifier did not resolve to a readable file
    #[error("unable to require {specifier} from {requester}: {source}")]
    ModuleNotFound {
        specifier: String,
        requester: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A package manifest could not be decoded
    #[error("unable to read package.json for {package}: {source}")]
    Manifest {
        package: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// A module required itself through its own dependency chain
    #[error("loop detected, {0} is already being required")]
    RequireLoop(String),

    /// `require` was called with bad arguments
    #[error("{0}")]
    InvalidRequire(String),

    /// A promise rejected with a value whose string form looks like an error
    #[error("{0}")]
    Rejected(String),

    /// A promise rejected with something that is not an error at all
    #[error("received non-Error from rejected Promise: {value} {type_name}")]
    NonErrorRejection { value: String, type_name: String },

    /// Engine-level failure reported by QuickJS
    #[error("engine error: {0}")]
    Engine(String),

    /// Invariant violation or caught panic
    #[error("internal error: {0}")]
    Internal(String),

    /// Filesystem error outside of module resolution
    #[error("io error: {0}")]
    Io(#[from] Arc<std::io::Error>),
}

impl VmError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a script error from an error name and message
    pub fn script(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// True for the cancellation sentinel: the operation did not complete,
    /// which is not the same thing as the script failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for VmError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<rquickjs::Error> for VmError {
    fn from(e: rquickjs::Error) -> Self {
        Self::Engine(e.to_string())
    }
}

/// Result type alias for VM operations
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_sentinel() {
        assert!(VmError::Cancelled.is_cancelled());
        assert!(!VmError::internal("boom").is_cancelled());
        assert_eq!(VmError::Cancelled.to_string(), "execution cancelled");
    }

    #[test]
    fn test_script_error_display() {
        let err = VmError::script("TypeError", "x is not a function");
        assert_eq!(err.to_string(), "TypeError: x is not a function");
    }

    #[test]
    fn test_interrupted_mentions_reason() {
        let err = VmError::Interrupted("vm is shutting down".into());
        assert!(err.to_string().contains("shutting down"));
    }

    #[test]
    fn test_module_not_found_keeps_context() {
        let err = VmError::ModuleNotFound {
            specifier: "./missing".into(),
            requester: "/srv/scripts".into(),
            source: Arc::new(std::io::Error::from(std::io::ErrorKind::NotFound)),
        };
        let msg = err.to_string();
        assert!(msg.contains("./missing"));
        assert!(msg.contains("/srv/scripts"));
    }
}
