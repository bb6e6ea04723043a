//! Timers API implementation (setTimeout, setInterval, setImmediate, clearTimeout, clearInterval)
//!
//! Every timer is a small thread that sleeps for the delay and then submits a
//! job that calls the callback. The callback and its arguments never leave the
//! interpreter: they sit in a hidden table keyed by timer id, and the job
//! looks them up when it fires. Timer threads stop when the timer is cleared
//! or when the generation that created them ends.

use crate::interpreter::Interpreter;
use crate::scheduler::JobSender;
use crate::signal::Signal;
use crate::value::type_name;
use crossbeam_channel::{after, select};
use parking_lot::Mutex;
use rquickjs::function::{Func, Opt, Rest};
use rquickjs::{Array, Coerced, Ctx, Exception, FromJs, Function, Object, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace};

const TIMER_TABLE: &str = "__squall_timers";

/// Minimum period of a repeating timer.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct TimerState {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Signal>>,
    sender: JobSender,
}

impl TimerState {
    fn cancel(&self, id: u64) -> bool {
        match self.active.lock().remove(&id) {
            Some(signal) => {
                signal.close();
                true
            }
            None => false,
        }
    }
}

/// Install the timer globals for the generation `sender` belongs to.
pub fn install<'js>(ctx: &Ctx<'js>, sender: JobSender) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set(TIMER_TABLE, Object::new(ctx.clone())?)?;

    let state = Arc::new(TimerState {
        next_id: AtomicU64::new(1),
        active: Mutex::new(HashMap::new()),
        sender,
    });

    globals.set(
        "setTimeout",
        Func::from({
            let state = state.clone();
            move |ctx: Ctx<'js>,
                  callback: Value<'js>,
                  delay: Opt<Value<'js>>,
                  args: Rest<Value<'js>>|
                  -> rquickjs::Result<f64> {
                let delay = delay_arg(&ctx, delay.0)?;
                schedule(&ctx, &state, callback, delay, args.0, false)
            }
        }),
    )?;

    globals.set(
        "setInterval",
        Func::from({
            let state = state.clone();
            move |ctx: Ctx<'js>,
                  callback: Value<'js>,
                  delay: Opt<Value<'js>>,
                  args: Rest<Value<'js>>|
                  -> rquickjs::Result<f64> {
                let delay = delay_arg(&ctx, delay.0)?.max(MIN_INTERVAL);
                schedule(&ctx, &state, callback, delay, args.0, true)
            }
        }),
    )?;

    globals.set(
        "setImmediate",
        Func::from({
            let state = state.clone();
            move |ctx: Ctx<'js>,
                  callback: Value<'js>,
                  args: Rest<Value<'js>>|
                  -> rquickjs::Result<f64> {
                schedule(&ctx, &state, callback, Duration::ZERO, args.0, false)
            }
        }),
    )?;

    for name in ["clearTimeout", "clearInterval"] {
        globals.set(
            name,
            Func::from({
                let state = state.clone();
                move |ctx: Ctx<'js>, id: Opt<Value<'js>>| -> rquickjs::Result<()> {
                    if let Some(id) = id.0.and_then(|v| id_arg(&ctx, v)) {
                        clear(&ctx, &state, id)?;
                    }
                    Ok(())
                }
            }),
        )?;
    }

    Ok(())
}

fn delay_arg<'js>(ctx: &Ctx<'js>, value: Option<Value<'js>>) -> rquickjs::Result<Duration> {
    let Some(value) = value else {
        return Ok(Duration::ZERO);
    };
    let millis = Coerced::<f64>::from_js(ctx, value)?.0;
    // Saturating cast: NaN and negative delays become 0.
    Ok(Duration::from_millis(millis as u64))
}

fn id_arg<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Option<u64> {
    if value.is_undefined() || value.is_null() {
        return None;
    }
    let id = Coerced::<f64>::from_js(ctx, value).ok()?.0;
    (id.is_finite() && id >= 1.0).then_some(id as u64)
}

fn schedule<'js>(
    ctx: &Ctx<'js>,
    state: &Arc<TimerState>,
    callback: Value<'js>,
    delay: Duration,
    args: Vec<Value<'js>>,
    repeating: bool,
) -> rquickjs::Result<f64> {
    if !callback.is_function() {
        let message = format!(
            "argument 0 must be a function, got {}",
            type_name(&callback)
        );
        return Err(Exception::throw_type(ctx, &message));
    }

    let id = state.next_id.fetch_add(1, Ordering::Relaxed);

    let entry = Object::new(ctx.clone())?;
    entry.set("fn", callback)?;
    let arguments = Array::new(ctx.clone())?;
    for (i, arg) in args.into_iter().enumerate() {
        arguments.set(i, arg)?;
    }
    entry.set("args", arguments)?;
    let table: Object = ctx.globals().get(TIMER_TABLE)?;
    table.set(id.to_string(), entry)?;

    let cancelled = Signal::new();
    state.active.lock().insert(id, cancelled.clone());

    let timer = state.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("squall-timer-{id}"))
        .spawn(move || run_timer(timer, id, delay, repeating, cancelled));
    if let Err(e) = spawned {
        state.cancel(id);
        table.remove(id.to_string())?;
        let message = format!("unable to start timer: {e}");
        return Err(Exception::throw_message(ctx, &message));
    }

    trace!(id, ?delay, repeating, "Timer scheduled");
    Ok(id as f64)
}

fn clear<'js>(ctx: &Ctx<'js>, state: &TimerState, id: u64) -> rquickjs::Result<()> {
    if state.cancel(id) {
        let table: Object = ctx.globals().get(TIMER_TABLE)?;
        table.remove(id.to_string())?;
        trace!(id, "Timer cleared");
    }
    Ok(())
}

/// Timer thread body.
fn run_timer(state: Arc<TimerState>, id: u64, delay: Duration, repeating: bool, cancelled: Signal) {
    let done = state.sender.done().clone();
    loop {
        let fired = select! {
            recv(done.receiver()) -> _ => false,
            recv(cancelled.receiver()) -> _ => false,
            recv(after(delay)) -> _ => true,
        };
        if !fired {
            break;
        }

        let job_state = state.clone();
        let job_cancelled = cancelled.clone();
        let submitted = state.sender.submit(Box::new(move |interpreter: &Interpreter| {
            fire(interpreter, &job_state, id, repeating, &job_cancelled);
        }));
        if !submitted || !repeating {
            break;
        }
    }
    debug!(id, "Timer thread exiting");
}

/// Timer job: call the callback stored under `id`.
fn fire(
    interpreter: &Interpreter,
    state: &TimerState,
    id: u64,
    repeating: bool,
    cancelled: &Signal,
) {
    // Cleared after the job was queued.
    if cancelled.is_closed() {
        return;
    }
    if !repeating {
        state.cancel(id);
    }

    interpreter.with(|ctx| {
        if let Err(e) = call_timer(&ctx, id, repeating) {
            let err = interpreter.convert_error(&ctx, e);
            error!(timer = id, error = %err, "Error handling deferred job");
        }
    });
}

fn call_timer<'js>(ctx: &Ctx<'js>, id: u64, repeating: bool) -> rquickjs::Result<()> {
    let table: Object = ctx.globals().get(TIMER_TABLE)?;
    let entry: Option<Object> = table.get(id.to_string())?;
    let Some(entry) = entry else {
        return Ok(());
    };
    if !repeating {
        table.remove(id.to_string())?;
    }

    let callback: Function = entry.get("fn")?;
    let arguments: Array = entry.get("args")?;
    let args = arguments
        .iter::<Value>()
        .collect::<rquickjs::Result<Vec<_>>>()?;
    callback.call::<_, Value>((Rest(args),))?;
    Ok(())
}
