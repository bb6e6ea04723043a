//! Results of scheduled execution.
//!
//! A [`Completion`] is the outcome of one job: resolved exactly once, either by
//! the job itself or with [`VmError::Cancelled`] when it is cancelled or its
//! generation ends first.
//!
//! An [`AsyncResult`] takes the value of a script completion and follows it
//! through promise settlement. The value never leaves the interpreter while it
//! is pending: a state object parked under a random global records the
//! outcome, and a poller thread checks it through scheduled jobs, backing off
//! from 10µs up to 100ms between checks.

use crate::config::PollBackoff;
use crate::error::{VmError, VmResult};
use crate::interpreter::{Interpreter, ValueRef, exception_to_error, unique_global};
use crate::scheduler::{Job, JobSender, execute_with_panic_handler};
use crate::signal::Signal;
use crate::value::{to_display_string, to_json, type_name};
use crossbeam_channel::{after, bounded, never, select};
use regex::Regex;
use rquickjs::{Ctx, Exception, Function, Object, Undefined, Value};
use std::sync::{Arc, LazyLock, OnceLock};
use tracing::{debug, trace, warn};

const RESULT_HANDLER: &str = "__squall_handle_result";

/// Settles `state.value` into `state.result` or `state.error`.
const RESULT_HANDLER_SOURCE: &str = r#"(function (state) {
  var value = state.value;
  var thenable = value !== null
    && (typeof value === 'object' || typeof value === 'function')
    && typeof value.then === 'function';
  if (thenable) {
    value.then(
      function (result) { state.result = result; state.done = true; },
      function (error) { state.error = error; state.rejected = true; state.done = true; }
    );
  } else if (value instanceof Error) {
    state.error = value;
    state.rejected = true;
    state.done = true;
  } else {
    state.result = value;
    state.done = true;
  }
})"#;

/// Rejection values whose string form reads like `TypeError: ...` or
/// `SomeException: ...`.
static ERROR_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)?(Error|Exception):").expect("valid regex"));

/// Outcome of one unit of scheduled work.
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

struct CompletionInner<T> {
    ready: Signal,
    cancel: Signal,
    slot: OnceLock<VmResult<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Completion<T> {
    /// Create a completion tied to a generation's done signal.
    ///
    /// A watcher thread resolves it as cancelled if `cancel` is called or
    /// `vm_done` closes before anything else resolves it.
    pub fn new(vm_done: &Signal) -> Self {
        Self::watching(Some(vm_done.clone()))
    }

    /// A completion that only `resolve` and `cancel` can settle.
    pub(crate) fn detached() -> Self {
        Self::watching(None)
    }

    fn watching(vm_done: Option<Signal>) -> Self {
        let completion = Self {
            inner: Arc::new(CompletionInner {
                ready: Signal::new(),
                cancel: Signal::new(),
                slot: OnceLock::new(),
            }),
        };

        if vm_done.as_ref().is_some_and(Signal::is_closed) {
            completion.resolve(Err(VmError::Cancelled));
            return completion;
        }

        let watched = completion.clone();
        let spawned = std::thread::Builder::new()
            .name("squall-result".to_string())
            .spawn(move || {
                let vm_done = vm_done
                    .as_ref()
                    .map(|s| s.receiver().clone())
                    .unwrap_or_else(never);
                select! {
                    recv(watched.inner.ready.receiver()) -> _ => {}
                    recv(watched.inner.cancel.receiver()) -> _ => {
                        watched.resolve(Err(VmError::Cancelled));
                    }
                    recv(vm_done) -> _ => {
                        watched.resolve(Err(VmError::Cancelled));
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn result watcher");
        }
        completion
    }

    /// Resolve the completion. Only the first call has any effect.
    pub fn resolve(&self, result: VmResult<T>) -> bool {
        if self.inner.slot.set(result).is_err() {
            debug!("Result already resolved, ignoring");
            return false;
        }
        self.inner.ready.close();
        true
    }

    /// Cancel the work. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancel.close() {
            trace!("Result cancelled");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_closed()
    }

    /// Closed once the completion is resolved.
    pub fn ready(&self) -> &Signal {
        &self.inner.ready
    }

    /// The outcome, if resolved.
    pub fn try_get(&self) -> Option<&VmResult<T>> {
        self.inner.slot.get()
    }
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    /// Block until resolved.
    pub fn wait(&self) -> VmResult<T> {
        self.inner.ready.wait();
        self.inner
            .slot
            .get()
            .cloned()
            .unwrap_or_else(|| Err(VmError::internal("result signalled without a value")))
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &self.inner.ready.is_closed())
            .field("cancelled", &self.inner.cancel.is_closed())
            .finish()
    }
}

/// A script completion followed through promise settlement.
#[derive(Clone, Debug)]
pub struct AsyncResult {
    outcome: Completion<serde_json::Value>,
}

impl AsyncResult {
    /// Follow `inner` to its settled value, polling through `sender`.
    ///
    /// The outcome is not bound to the generation directly: `inner` is, and
    /// the poller watches the generation itself, so an error that `inner`
    /// resolved with just before the generation ended is not replaced by a
    /// cancellation.
    pub(crate) fn spawn(
        inner: Completion<ValueRef>,
        sender: JobSender,
        backoff: PollBackoff,
    ) -> Self {
        let outcome = Completion::detached();
        let poller = Poller {
            inner,
            outcome: outcome.clone(),
            sender,
            backoff,
            state_var: unique_global("__squall_await_"),
        };
        let spawned = std::thread::Builder::new()
            .name("squall-await".to_string())
            .spawn(move || poller.run());
        if let Err(e) = spawned {
            outcome.resolve(Err(VmError::internal(format!(
                "failed to spawn result poller: {e}"
            ))));
        }
        Self { outcome }
    }

    /// An async result that has already failed.
    pub(crate) fn failed(error: VmError) -> Self {
        let outcome = Completion::detached();
        outcome.resolve(Err(error));
        Self { outcome }
    }

    /// Block until the value settles.
    pub fn wait(&self) -> VmResult<serde_json::Value> {
        self.outcome.wait()
    }

    /// Wait for the value without blocking the async runtime.
    pub async fn resolved(&self) -> VmResult<serde_json::Value> {
        let outcome = self.outcome.clone();
        tokio::task::spawn_blocking(move || outcome.wait())
            .await
            .map_err(|e| VmError::internal(format!("wait task failed: {e}")))?
    }

    /// Stop waiting. The result resolves as cancelled unless it already
    /// resolved. Idempotent.
    pub fn cancel(&self) {
        self.outcome.cancel();
    }

    pub fn is_ready(&self) -> bool {
        self.outcome.is_ready()
    }

    pub fn try_get(&self) -> Option<&VmResult<serde_json::Value>> {
        self.outcome.try_get()
    }
}

struct Poller {
    inner: Completion<ValueRef>,
    outcome: Completion<serde_json::Value>,
    sender: JobSender,
    backoff: PollBackoff,
    state_var: String,
}

impl Poller {
    fn run(self) {
        select! {
            recv(self.inner.ready().receiver()) -> _ => {}
            recv(self.outcome.ready().receiver()) -> _ => {}
        }
        if self.outcome.is_ready() {
            // Cancelled while the script was still queued or running.
            self.inner.cancel();
            let value = self.inner.wait().ok();
            self.cleanup(value);
            return;
        }

        let value = match self.inner.wait() {
            Ok(value) => value,
            Err(e) => {
                self.outcome.resolve(Err(e));
                return;
            }
        };

        let state_var = self.state_var.clone();
        let retained = value.clone();
        let outcome = self.outcome.clone();
        self.round_trip(Box::new(move |interpreter: &Interpreter| {
            let result = execute_with_panic_handler(|| {
                setup(interpreter, &retained, &state_var, &outcome)
            });
            if let Err(e) = result {
                outcome.resolve(Err(e));
            }
        }));

        let mut delay = self.backoff.initial;
        while !self.outcome.is_ready() {
            let elapsed = select! {
                recv(self.outcome.ready().receiver()) -> _ => false,
                recv(self.sender.done().receiver()) -> _ => {
                    // Generation ended without settling.
                    self.outcome.resolve(Err(VmError::Cancelled));
                    false
                }
                recv(after(delay)) -> _ => true,
            };
            if !elapsed {
                break;
            }
            delay = self.backoff.next(delay);

            let state_var = self.state_var.clone();
            let outcome = self.outcome.clone();
            self.round_trip(Box::new(move |interpreter: &Interpreter| {
                let result = execute_with_panic_handler(|| {
                    interpreter.with(|ctx| -> VmResult<()> {
                        let state: Object = ctx.globals().get(state_var.as_str())?;
                        check(&ctx, &state, &outcome)
                    })
                });
                if let Err(e) = result {
                    outcome.resolve(Err(e));
                }
            }));
        }

        self.cleanup(Some(value));
    }

    /// Submit a job and wait until it has run or been dropped, or until the
    /// outcome resolves some other way.
    fn round_trip(&self, job: Job) {
        let (tx, rx) = bounded::<()>(1);
        let submitted = self.sender.submit(Box::new(move |interpreter: &Interpreter| {
            job(interpreter);
            let _ = tx.send(());
        }));
        if !submitted {
            return;
        }
        select! {
            recv(rx) -> _ => {}
            recv(self.outcome.ready().receiver()) -> _ => {}
            recv(self.sender.done().receiver()) -> _ => {}
        }
    }

    fn cleanup(&self, value: Option<ValueRef>) {
        let state_var = self.state_var.clone();
        self.sender.submit(Box::new(move |interpreter: &Interpreter| {
            interpreter.remove_global(&state_var);
            if let Some(value) = value {
                interpreter.remove_global(value.name());
            }
        }));
    }
}

/// Park the value in a state object, hand it to the result handler and check
/// it once, after draining promise reactions.
fn setup(
    interpreter: &Interpreter,
    value: &ValueRef,
    state_var: &str,
    outcome: &Completion<serde_json::Value>,
) -> VmResult<()> {
    interpreter.with(|ctx| -> VmResult<()> {
        let value = interpreter.take_retained(&ctx, value)?;
        let state = Object::new(ctx.clone())?;
        state.set("value", value)?;
        state.set("result", Undefined)?;
        state.set("error", Undefined)?;
        state.set("rejected", false)?;
        state.set("done", false)?;
        ctx.globals().set(state_var, state.clone())?;

        let handler = result_handler(&ctx).map_err(|e| interpreter.convert_error(&ctx, e))?;
        handler
            .call::<_, ()>((state,))
            .map_err(|e| interpreter.convert_error(&ctx, e))?;
        Ok(())
    })?;

    interpreter.run_pending_jobs();

    interpreter.with(|ctx| -> VmResult<()> {
        let state: Object = ctx.globals().get(state_var)?;
        check(&ctx, &state, outcome)
    })
}

/// The memoized result handler of this interpreter.
fn result_handler<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
    let globals = ctx.globals();
    if let Some(handler) = globals.get::<_, Option<Function>>(RESULT_HANDLER)? {
        return Ok(handler);
    }
    let handler: Function = ctx.eval(RESULT_HANDLER_SOURCE)?;
    globals.set(RESULT_HANDLER, handler.clone())?;
    Ok(handler)
}

/// Resolve `outcome` if the state object has settled.
fn check<'js>(
    ctx: &Ctx<'js>,
    state: &Object<'js>,
    outcome: &Completion<serde_json::Value>,
) -> VmResult<()> {
    if !state.get::<_, bool>("done")? {
        return Ok(());
    }

    let settled = if state.get::<_, bool>("rejected")? {
        let error: Value = state.get("error")?;
        Err(classify_rejection(ctx, error))
    } else {
        let result: Value = state.get("result")?;
        to_json(ctx, result)
    };
    outcome.resolve(settled);
    Ok(())
}

/// Turn a rejection value into an error.
///
/// Error objects keep their name, message and stack. Anything else is judged
/// by its string form, which is a heuristic: a string rejection that happens
/// to start with `SomethingError:` is reported as an error message, and an
/// Error-like object with an unusual `toString` may not be.
fn classify_rejection<'js>(ctx: &Ctx<'js>, error: Value<'js>) -> VmError {
    let is_exception = error
        .as_object()
        .is_some_and(|obj| Exception::from_object(obj.clone()).is_some());
    if is_exception {
        return exception_to_error(ctx, error);
    }

    let type_name = type_name(&error).to_string();
    let text = match to_display_string(ctx, error) {
        Ok(text) => text,
        Err(e) => return e,
    };
    if ERROR_LIKE.is_match(&text) {
        VmError::Rejected(text)
    } else {
        VmError::NonErrorRejection {
            value: text,
            type_name,
        }
    }
}
