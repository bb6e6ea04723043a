//! The interpreter owned by one scheduler generation.
//!
//! An [`Interpreter`] is created on the worker thread and never leaves it:
//! QuickJS is not thread safe, and the only way other threads reach it is by
//! submitting jobs. Jobs receive `&Interpreter` and enter the context with
//! [`Interpreter::with`].

use crate::compile::Program;
use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rquickjs::context::EvalOptions;
use rquickjs::{Coerced, Context, Ctx, Exception, FromJs, Object, Runtime, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Shared interrupt request for one generation.
///
/// The flag is read by the QuickJS interrupt hook on the worker thread and set
/// from whichever thread is shutting the scheduler down. A request only
/// applies to the job running when it is made: the worker resets the state
/// before every job, so a request made while idle is dropped.
#[derive(Debug, Default)]
pub(crate) struct InterruptState {
    requested: AtomicBool,
    fired: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl InterruptState {
    pub fn request(&self, reason: impl Into<String>) {
        *self.reason.lock() = Some(reason.into());
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending request. Called from the interrupt hook.
    fn fire(&self) -> bool {
        let fired = self.requested.swap(false, Ordering::SeqCst);
        if fired {
            self.fired.store(true, Ordering::SeqCst);
        }
        fired
    }

    /// Reason of the request that aborted execution, if the hook fired since
    /// the last reset.
    pub fn take_fired(&self) -> Option<String> {
        if !self.fired.swap(false, Ordering::SeqCst) {
            return None;
        }
        Some(
            self.reason
                .lock()
                .take()
                .unwrap_or_else(|| "interrupted".to_string()),
        )
    }

    /// Forget any request. Called on the worker before each job.
    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
        self.fired.store(false, Ordering::SeqCst);
        *self.reason.lock() = None;
    }
}

/// Handle to a script value parked in the interpreter between jobs.
///
/// Interpreter values are bound to the worker thread, so a completed script
/// leaves its value under a transient global and hands out this name instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRef {
    name: String,
}

impl ValueRef {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Random, collision-resistant global name with the given prefix.
pub(crate) fn unique_global(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

pub struct Interpreter {
    // Declared before `runtime` so the context is dropped first.
    context: Context,
    runtime: Runtime,
    interrupt: Arc<InterruptState>,
    generation: u64,
}

impl Interpreter {
    pub(crate) fn new(
        generation: u64,
        interrupt: Arc<InterruptState>,
        config: &VmConfig,
    ) -> VmResult<Self> {
        let runtime = Runtime::new()?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_size {
            runtime.set_max_stack_size(limit);
        }

        let flag = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || flag.fire())));

        let context = Context::full(&runtime)?;
        debug!(generation, "Interpreter created");

        Ok(Self {
            context,
            runtime,
            interrupt,
            generation,
        })
    }

    /// Drop interrupt requests made before the next job starts.
    pub(crate) fn reset_interrupt(&self) {
        self.interrupt.reset();
    }

    /// Generation this interpreter belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enter the interpreter context.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        self.context.with(f)
    }

    /// Evaluate a compiled program as a global script.
    pub fn eval<'js>(&self, ctx: &Ctx<'js>, program: &Program) -> VmResult<Value<'js>> {
        ctx.eval_with_options::<Value, _>(program.source(), script_options())
            .map_err(|e| self.convert_error(ctx, e))
    }

    /// Evaluate a program and park its completion value for a later job.
    pub fn eval_retained(&self, program: &Program) -> VmResult<ValueRef> {
        self.with(|ctx| -> VmResult<ValueRef> {
            let value = self.eval(&ctx, program)?;
            let name = unique_global("__squall_value_");
            ctx.globals().set(name.as_str(), value)?;
            Ok(ValueRef { name })
        })
    }

    /// Take a parked value back out of the global scope.
    pub fn take_retained<'js>(&self, ctx: &Ctx<'js>, value: &ValueRef) -> VmResult<Value<'js>> {
        let globals = ctx.globals();
        let v: Value = globals.get(value.name())?;
        globals.remove(value.name())?;
        Ok(v)
    }

    /// Delete a global binding if it exists.
    pub fn remove_global(&self, name: &str) {
        self.with(|ctx| {
            if let Err(e) = ctx.globals().remove(name) {
                debug!(error = %e, name, "Failed to remove transient global");
            }
        });
    }

    /// Convert an engine error into a `VmError`, pulling the pending exception
    /// out of the context when there is one.
    pub fn convert_error(&self, ctx: &Ctx<'_>, error: rquickjs::Error) -> VmError {
        if error.is_exception() {
            let thrown = ctx.catch();
            if let Some(reason) = self.interrupt.take_fired() {
                return VmError::Interrupted(reason);
            }
            return exception_to_error(ctx, thrown);
        }
        VmError::from(error)
    }

    /// Run queued promise reactions until the queue is empty.
    pub(crate) fn run_pending_jobs(&self) {
        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    if let Some(reason) = self.interrupt.take_fired() {
                        debug!(generation = self.generation, reason, "Pending jobs interrupted");
                        break;
                    }
                    warn!(generation = self.generation, "Pending job threw an exception");
                }
            }
        }
    }
}

/// Sloppy-mode global script evaluation.
pub(crate) fn script_options() -> EvalOptions {
    let mut options = EvalOptions::default();
    options.strict = false;
    options.global = true;
    options
}

/// Build a `VmError` from a thrown script value.
pub(crate) fn exception_to_error<'js>(ctx: &Ctx<'js>, thrown: Value<'js>) -> VmError {
    if let Some(obj) = thrown.as_object() {
        if let Some(exception) = Exception::from_object(obj.clone()) {
            let name = error_name(obj);
            let message = exception.message().unwrap_or_default();
            return VmError::Script {
                name,
                message,
                stack: exception.stack().filter(|s| !s.is_empty()),
            };
        }
    }
    match Coerced::<String>::from_js(ctx, thrown) {
        Ok(text) => VmError::script("Error", text.0),
        Err(e) => VmError::Engine(format!("failed to stringify exception: {e}")),
    }
}

fn error_name(obj: &Object<'_>) -> String {
    obj.get::<_, Coerced<String>>("name")
        .map(|n| n.0)
        .ok()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Error".to_string())
}
