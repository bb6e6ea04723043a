//! Integration tests for the Vm facade

use serde_json::json;
use squall_vm::{Interpreter, Module, Vm, VmConfig, VmError, VmResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

fn started() -> Vm {
    let vm = Vm::new(VmConfig::default());
    vm.start().unwrap();
    vm
}

#[test]
fn test_run_string() {
    let vm = started();
    assert_eq!(vm.run_string("10 + 5").wait().unwrap(), json!(15));
    vm.shutdown().unwrap();
}

#[test]
fn test_restart_gets_fresh_interpreter() {
    let vm = started();
    vm.run_string("var leftover = 1;").wait().unwrap();
    assert_eq!(vm.run_string("10 + 5").wait().unwrap(), json!(15));
    vm.shutdown().unwrap();

    vm.start().unwrap();
    assert_eq!(vm.run_string("15 + 10").wait().unwrap(), json!(25));
    assert_eq!(
        vm.run_string("typeof leftover").wait().unwrap(),
        json!("undefined")
    );
    vm.shutdown().unwrap();
}

#[test]
fn test_start_and_shutdown_are_idempotent() {
    let vm = Vm::new(VmConfig::default());
    vm.shutdown().unwrap();
    vm.start().unwrap();
    vm.start().unwrap();
    assert!(vm.is_running());
    vm.shutdown().unwrap();
    vm.shutdown().unwrap();
    assert!(!vm.is_running());
}

#[test]
fn test_shutdown_interrupts_runaway_script() {
    let vm = started();
    let result = vm.run_string("for(;;){}");
    thread::sleep(Duration::from_millis(50));

    vm.shutdown().unwrap();
    let err = result.wait().unwrap_err();
    assert!(matches!(err, VmError::Interrupted(_)));
    assert!(err.to_string().contains("shutting down"), "{err}");
}

#[test]
fn test_interrupt_aborts_current_script_only() {
    let vm = started();
    let result = vm.run_string("for(;;){}");
    thread::sleep(Duration::from_millis(50));
    vm.interrupt("enough");

    let err = result.wait().unwrap_err();
    assert!(matches!(err, VmError::Interrupted(reason) if reason == "enough"));
    assert_eq!(vm.run_string("1 + 1").wait().unwrap(), json!(2));
    vm.shutdown().unwrap();
}

#[test]
fn test_interrupt_while_idle_is_dropped() {
    let vm = started();
    assert_eq!(vm.run_string("1").wait().unwrap(), json!(1));
    vm.interrupt("stale");

    let err = vm.run_string("throw new Error('boom')").wait().unwrap_err();
    match err {
        VmError::Script { name, message, .. } => {
            assert_eq!(name, "Error");
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let value = vm
        .run_string("var total = 0; for (var i = 0; i < 100000; i++) { total += i; } total")
        .wait()
        .unwrap();
    assert_eq!(value, json!(4999950000u64));
    vm.shutdown().unwrap();
}

#[test]
fn test_soft_timeout_drains_backlog() {
    let config = VmConfig::default()
        .shutdown_timeouts(Duration::from_millis(100), Duration::from_secs(2));
    let vm = Vm::new(config);
    vm.start().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    assert!(vm.run(|_: &Interpreter| thread::sleep(Duration::from_millis(400))));
    let flag = ran.clone();
    assert!(vm.run(move |_: &Interpreter| flag.store(true, Ordering::SeqCst)));
    let queued = vm.run_string("1 + 1");

    vm.shutdown().unwrap();
    assert!(!vm.is_running());
    assert!(queued.wait().unwrap_err().is_cancelled());
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_hard_timeout_gives_up() {
    let config = VmConfig::default()
        .shutdown_timeouts(Duration::from_millis(100), Duration::from_millis(100));
    let vm = Vm::new(config);
    vm.start().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    assert!(vm.run(|_: &Interpreter| thread::sleep(Duration::from_millis(800))));
    let flag = ran.clone();
    assert!(vm.run(move |_: &Interpreter| flag.store(true, Ordering::SeqCst)));
    let queued = vm.run_string("1 + 1");

    let started_at = Instant::now();
    let err = vm.shutdown().unwrap_err();
    assert!(matches!(err, VmError::ShutdownTimeout), "{err}");
    assert!(started_at.elapsed() < Duration::from_millis(700));

    // The stop job still runs once the blocking job returns.
    assert!(queued.wait().unwrap_err().is_cancelled());
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_run_when_stopped_is_cancelled() {
    let vm = Vm::new(VmConfig::default());
    let err = vm.run_string("1").wait().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!vm.run(|_: &Interpreter| {}));
}

#[test]
fn test_jobs_run_in_submission_order() {
    let vm = started();
    let (tx, rx) = mpsc::channel();
    for i in 0..100 {
        let tx = tx.clone();
        assert!(vm.run(move |_: &Interpreter| tx.send(i).unwrap()));
    }
    let seen: Vec<i32> = (0..100).map(|_| rx.recv().unwrap()).collect();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    vm.shutdown().unwrap();
}

#[test]
fn test_concurrent_callers() {
    let vm = started();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let vm = vm.clone();
            thread::spawn(move || vm.run_string(&format!("{i} * 2")).wait().unwrap())
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), json!(i * 2));
    }
    vm.shutdown().unwrap();
}

#[test]
fn test_syntax_error_surfaces_from_run_script() {
    let vm = started();
    let err = vm.run_script("broken.js", "function (").wait().unwrap_err();
    assert!(matches!(err, VmError::Syntax { file, .. } if file == "broken.js"));
    vm.shutdown().unwrap();
}

#[test]
fn test_thrown_error_keeps_name_and_message() {
    let vm = started();
    let err = vm
        .run_string("throw new RangeError('out of range')")
        .wait()
        .unwrap_err();
    match err {
        VmError::Script { name, message, .. } => {
            assert_eq!(name, "RangeError");
            assert_eq!(message, "out of range");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    vm.shutdown().unwrap();
}

fn push_hook(
    label: &'static str,
) -> impl Fn(&Interpreter) -> VmResult<()> + Send + Sync + 'static {
    move |interp: &Interpreter| {
        let source = format!("(globalThis.order = globalThis.order || []).push('{label}')");
        interp.with(|ctx| ctx.eval::<(), _>(source))?;
        Ok(())
    }
}

#[test]
fn test_init_hooks_run_in_order() {
    let vm = Vm::builder().init_hook(push_hook("builder")).build();
    vm.on_runtime_init(push_hook("appended"));
    vm.prepend_runtime_init(push_hook("prepended"));

    vm.start().unwrap();
    assert_eq!(
        vm.run_string("order").wait().unwrap(),
        json!(["prepended", "builder", "appended"])
    );
    assert_eq!(
        vm.run_string("typeof require + ' ' + typeof setTimeout + ' ' + typeof console.log")
            .wait()
            .unwrap(),
        json!("function function function")
    );
    vm.shutdown().unwrap();

    // Hooks run again for every generation.
    vm.start().unwrap();
    assert_eq!(vm.run_string("order.length").wait().unwrap(), json!(3));
    vm.shutdown().unwrap();
}

#[test]
fn test_failing_init_hook_is_not_fatal() {
    let vm = Vm::builder()
        .init_hook(|_: &Interpreter| Err(VmError::internal("hook failed")))
        .build();
    vm.start().unwrap();
    assert_eq!(vm.run_string("3").wait().unwrap(), json!(3));
    vm.shutdown().unwrap();
}

#[test]
fn test_compile_then_run_program() {
    let vm = started();
    let program = vm.compile("double.js", "[1, 2, 3].map(x => x * 2)").unwrap();
    assert_eq!(program.name(), "double.js");
    assert_eq!(vm.run_program(&program).wait().unwrap(), json!([2, 4, 6]));
    assert_eq!(vm.run_program(&program).wait().unwrap(), json!([2, 4, 6]));
    vm.shutdown().unwrap();
}

#[test]
fn test_transformer_fallback_in_compile() {
    let vm = Vm::builder().typescript().build();
    vm.start().unwrap();
    let value = vm
        .run_script("typed.ts", "const n: number = 20; n + 22")
        .wait()
        .unwrap();
    assert_eq!(value, json!(42));
    vm.shutdown().unwrap();
}

#[test]
fn test_set_module_is_requirable() {
    let vm = started();
    vm.set_module(Module::new("greeting", "module.exports = 'hello, world!';"));
    assert_eq!(
        vm.run_string("require('greeting')").wait().unwrap(),
        json!("hello, world!")
    );
    vm.shutdown().unwrap();
}

#[test]
fn test_stats_count_jobs() {
    let vm = started();
    vm.run_string("1").wait().unwrap();
    vm.shutdown().unwrap();
    let stats = vm.stats();
    assert!(stats.jobs_executed >= 3, "{stats:?}");
    assert_eq!(stats.jobs_panicked, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resolved_is_async() {
    let vm = started();
    let value = vm.run_string("'async ' + 'wait'").resolved().await.unwrap();
    assert_eq!(value, json!("async wait"));
    let stopper = vm.clone();
    tokio::task::spawn_blocking(move || stopper.shutdown())
        .await
        .unwrap()
        .unwrap();
}
