//! Promise bridging through AsyncResult

use serde_json::json;
use squall_vm::{Vm, VmConfig, VmError};
use std::time::Duration;

fn started() -> Vm {
    let vm = Vm::new(VmConfig::default());
    vm.start().unwrap();
    vm
}

#[test]
fn test_native_promise() {
    let vm = started();
    let value = vm
        .run_string("new Promise(resolve => resolve('hello, world!'))")
        .wait()
        .unwrap();
    assert_eq!(value, json!("hello, world!"));
    vm.shutdown().unwrap();
}

#[test]
fn test_promise_settled_by_timer() {
    let vm = started();
    let value = vm
        .run_string("new Promise(resolve => setTimeout(() => resolve({ answer: 42 }), 20))")
        .wait()
        .unwrap();
    assert_eq!(value, json!({ "answer": 42 }));
    vm.shutdown().unwrap();
}

#[test]
fn test_async_function() {
    let vm = started();
    let value = vm
        .run_string(
            r#"
            async function sum(a, b) {
                await null;
                return a + b;
            }
            sum(19, 23)
        "#,
        )
        .wait()
        .unwrap();
    assert_eq!(value, json!(42));
    vm.shutdown().unwrap();
}

#[test]
fn test_thenable() {
    let vm = started();
    let value = vm
        .run_string("({ then(resolve) { resolve(7); } })")
        .wait()
        .unwrap();
    assert_eq!(value, json!(7));
    vm.shutdown().unwrap();
}

#[test]
fn test_undefined_and_functions_export_as_null() {
    let vm = started();
    assert_eq!(vm.run_string("undefined").wait().unwrap(), json!(null));
    assert_eq!(vm.run_string("(function () {})").wait().unwrap(), json!(null));
    assert_eq!(
        vm.run_string("({ a: 1, f() {} })").wait().unwrap(),
        json!({ "a": 1 })
    );
    vm.shutdown().unwrap();
}

#[test]
fn test_rejection_with_error_object() {
    let vm = started();
    let err = vm
        .run_string("Promise.reject(new TypeError('bad input'))")
        .wait()
        .unwrap_err();
    match err {
        VmError::Script { name, message, .. } => {
            assert_eq!(name, "TypeError");
            assert_eq!(message, "bad input");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    vm.shutdown().unwrap();
}

#[test]
fn test_error_value_is_an_error() {
    let vm = started();
    let err = vm.run_string("new Error('plain')").wait().unwrap_err();
    assert!(matches!(err, VmError::Script { message, .. } if message == "plain"));
    vm.shutdown().unwrap();
}

#[test]
fn test_rejection_with_error_like_string() {
    let vm = started();
    let err = vm
        .run_string("Promise.reject('CustomException: hello, world')")
        .wait()
        .unwrap_err();
    assert!(matches!(err, VmError::Rejected(text) if text == "CustomException: hello, world"));
    vm.shutdown().unwrap();
}

#[test]
fn test_rejection_with_non_error() {
    let vm = started();
    let err = vm.run_string("Promise.reject(42)").wait().unwrap_err();
    match err {
        VmError::NonErrorRejection { value, type_name } => {
            assert_eq!(value, "42");
            assert_eq!(type_name, "number");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    vm.shutdown().unwrap();
}

#[test]
fn test_pending_promise_cancelled_by_shutdown() {
    let vm = started();
    let result = vm.run_string("new Promise(() => {})");
    std::thread::sleep(Duration::from_millis(50));
    assert!(!result.is_ready());

    vm.shutdown().unwrap();
    assert!(result.wait().unwrap_err().is_cancelled());
}

#[test]
fn test_explicit_cancel() {
    let vm = started();
    let result = vm.run_string("new Promise(() => {})");
    result.cancel();
    result.cancel();
    assert!(result.wait().unwrap_err().is_cancelled());
    assert_eq!(vm.run_string("'still alive'").wait().unwrap(), json!("still alive"));
    vm.shutdown().unwrap();
}

#[test]
fn test_transient_globals_are_cleaned_up() {
    let vm = started();
    vm.run_string("new Promise(r => setTimeout(() => r(1), 5))")
        .wait()
        .unwrap();
    // The cleanup job runs after resolution; give it a moment.
    std::thread::sleep(Duration::from_millis(50));
    let leftovers = vm
        .run_string(
            "Object.keys(globalThis).filter(k => k.startsWith('__squall_await_') \
             || k.startsWith('__squall_value_')).length",
        )
        .wait()
        .unwrap();
    assert_eq!(leftovers, json!(0));
    vm.shutdown().unwrap();
}
