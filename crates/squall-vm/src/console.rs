//! The `console` global.
//!
//! Every method formats its arguments into one line and hands it to a single
//! process-wide handler, which logs through `tracing` unless replaced.

use parking_lot::RwLock;
use rquickjs::function::{Func, Rest};
use rquickjs::{Coerced, Ctx, FromJs, Object, Value};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

/// Severity of a `console` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

impl ConsoleLevel {
    /// Name of the `console` method for this level.
    pub fn method(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Debug => "debug",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
        }
    }
}

const LEVELS: [ConsoleLevel; 5] = [
    ConsoleLevel::Log,
    ConsoleLevel::Info,
    ConsoleLevel::Debug,
    ConsoleLevel::Warn,
    ConsoleLevel::Error,
];

type ConsoleHandler = Arc<dyn Fn(ConsoleLevel, &str) + Send + Sync + 'static>;

/// Process-wide sink for script output; shared by every VM.
fn handler_slot() -> &'static RwLock<ConsoleHandler> {
    static HANDLER: OnceLock<RwLock<ConsoleHandler>> = OnceLock::new();
    HANDLER.get_or_init(|| RwLock::new(Arc::new(trace_console)))
}

/// Replace where `console` output goes. By default it is logged through
/// `tracing` under the `squall::console` target.
pub fn set_console_handler(handler: impl Fn(ConsoleLevel, &str) + Send + Sync + 'static) {
    *handler_slot().write() = Arc::new(handler);
}

fn trace_console(level: ConsoleLevel, message: &str) {
    let method = level.method();
    match level {
        ConsoleLevel::Log | ConsoleLevel::Info => {
            info!(target: "squall::console", method, "{message}")
        }
        ConsoleLevel::Debug => debug!(target: "squall::console", method, "{message}"),
        ConsoleLevel::Warn => warn!(target: "squall::console", method, "{message}"),
        ConsoleLevel::Error => error!(target: "squall::console", method, "{message}"),
    }
}

/// Register the console object on the global scope.
pub fn register_console<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;

    for level in LEVELS {
        console.set(
            level.method(),
            Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
                let message = format_console_args(&ctx, args.0);
                // Cloned out so a handler may replace itself.
                let handler = handler_slot().read().clone();
                handler(level, &message);
            }),
        )?;
    }

    ctx.globals().set("console", console)
}

fn format_console_args<'js>(ctx: &Ctx<'js>, args: Vec<Value<'js>>) -> String {
    let mut parts = Vec::with_capacity(args.len());

    for value in args {
        if value.is_object() && !value.is_function() {
            match ctx.json_stringify(value.clone()) {
                Ok(Some(json)) => {
                    if let Ok(s) = json.to_string() {
                        parts.push(s);
                        continue;
                    }
                }
                Ok(None) => {}
                // Unserializable; clear the exception and print String(value).
                Err(_) => {
                    ctx.catch();
                }
            }
        }

        match Coerced::<String>::from_js(ctx, value) {
            Ok(s) => parts.push(s.0),
            Err(_) => parts.push("[object]".to_string()),
        }
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_methods_reach_the_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        set_console_handler(move |level, message| {
            if message.starts_with("console-test") {
                sink.lock().push((level, message.to_string()));
            }
        });

        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            register_console(&ctx).unwrap();
            ctx.eval::<(), _>("console.warn('console-test', 1); console.log('console-test', [2])")
                .unwrap();
        });
        set_console_handler(trace_console);

        assert_eq!(
            *seen.lock(),
            [
                (ConsoleLevel::Warn, "console-test 1".to_string()),
                (ConsoleLevel::Log, "console-test [2]".to_string()),
            ]
        );
    }

    #[test]
    fn test_format_console_args() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let args: rquickjs::Array = ctx.eval("['count', 3, { a: 1 }, null]").unwrap();
            let values: Vec<Value> = args.iter().collect::<rquickjs::Result<_>>().unwrap();
            assert_eq!(format_console_args(&ctx, values), r#"count 3 {"a":1} null"#);

            let circular: Value = ctx.eval("var c = {}; c.c = c; c").unwrap();
            assert_eq!(format_console_args(&ctx, vec![circular]), "[object Object]");
        });
    }
}
