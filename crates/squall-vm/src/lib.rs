//! squall-vm - a concurrency-safe embedded JavaScript VM.
//!
//! QuickJS is single threaded. This crate gives it one dedicated worker
//! thread and lets any number of other threads drive it by submitting jobs.
//! On top of that it provides timers, promise bridging and a CommonJS
//! `require` with a module cache.
//!
//! # Features
//!
//! - **Serialized access**: a bounded FIFO queue feeds a single worker; the
//!   interpreter never leaves that thread
//! - **Restartable**: `shutdown`/`start` open a new generation with a fresh
//!   interpreter; soft and hard shutdown timeouts interrupt runaway scripts
//! - **Timers**: `setTimeout`, `setInterval`, `setImmediate` and their
//!   `clear*` counterparts, fired as queued jobs
//! - **Promises**: results of scripts that return promises or thenables are
//!   followed until they settle
//! - **CommonJS**: relative files, `node_modules` packages, registered
//!   modules, loop detection, and an optional transform for sources that do
//!   not parse (TypeScript, for one)
//!
//! # Example
//!
//! ```no_run
//! use squall_vm::{Vm, VmConfig};
//!
//! let vm = Vm::new(VmConfig::default().modules_path("./scripts"));
//! vm.start().unwrap();
//!
//! let value = vm
//!     .run_string("new Promise(resolve => setTimeout(() => resolve(40 + 2), 10))")
//!     .wait()
//!     .unwrap();
//! assert_eq!(value, serde_json::json!(42));
//!
//! vm.shutdown().unwrap();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Vm                               │
//! │   run_string / run_script / run_program / set_module        │
//! └─────────────────────────────────────────────────────────────┘
//!            │ jobs                               ↑ AsyncResult
//!            ↓                                    │ (polls via jobs)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Scheduler                           │
//! │  bounded queue → worker thread → Interpreter (QuickJS)      │
//! └─────────────────────────────────────────────────────────────┘
//!            ↑ timer jobs                         │ require()
//!            │                                    ↓
//! ┌─────────────────────┐              ┌─────────────────────────┐
//! │   timer threads     │              │    Registry (modules)   │
//! └─────────────────────┘              └─────────────────────────┘
//! ```

pub mod compile;
pub mod config;
pub mod console;
pub mod error;
pub mod interpreter;
pub mod modules;
pub mod result;
pub mod scheduler;
pub mod scripts;
pub mod signal;
mod timers;
pub mod transform;
pub mod value;
pub mod vm;

pub use compile::{Program, Transform, check_syntax, compile};
pub use config::VmConfig;
pub use console::{ConsoleLevel, set_console_handler};
pub use error::{VmError, VmResult};
pub use interpreter::{Interpreter, ValueRef};
pub use modules::{EntryKind, Manifest, Module, OsFs, Registry, SourceFs};
pub use result::{AsyncResult, Completion};
pub use scheduler::{InitHook, Job, JobSender, Scheduler, SchedulerStatsSnapshot};
pub use scripts::{Script, ScriptManager};
pub use signal::Signal;
pub use transform::{strip_types, typescript_transformer};
pub use vm::{Vm, VmBuilder};

pub mod prelude {
    pub use crate::compile::{Program, Transform};
    pub use crate::config::VmConfig;
    pub use crate::error::{VmError, VmResult};
    pub use crate::interpreter::Interpreter;
    pub use crate::modules::Module;
    pub use crate::result::AsyncResult;
    pub use crate::scripts::ScriptManager;
    pub use crate::vm::{Vm, VmBuilder};
}
