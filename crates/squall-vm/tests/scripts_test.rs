//! Running a directory of scripts

use serde_json::json;
use squall_vm::{ScriptManager, Vm, VmConfig};

fn scripts_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in files {
        std::fs::write(dir.path().join(name), body).unwrap();
    }
    dir
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_all_in_name_order() {
    let dir = scripts_dir(&[
        ("20-second.js", "log.push('second');"),
        ("10-first.js", "var log = ['first'];"),
        ("30-third.js", "log.push(require('./lib').name);"),
        ("lib.txt", "not a script"),
    ]);
    std::fs::create_dir(dir.path().join("lib")).unwrap();
    std::fs::write(dir.path().join("lib/index.js"), "exports.name = 'third';").unwrap();

    let vm = Vm::new(VmConfig::default().modules_path(dir.path()));
    vm.start().unwrap();

    ScriptManager::new(dir.path()).run_all(&vm).await.unwrap();
    let value = vm.run_string("log").resolved().await.unwrap();
    assert_eq!(value, json!(["first", "second", "third"]));

    let stopper = vm.clone();
    tokio::task::spawn_blocking(move || stopper.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_all_stops_at_first_failure() {
    let dir = scripts_dir(&[
        ("a.js", "var reached = ['a'];"),
        ("b.js", "throw new Error('b failed');"),
        ("c.js", "reached.push('c');"),
    ]);
    let vm = Vm::new(VmConfig::default());
    vm.start().unwrap();

    let err = ScriptManager::new(dir.path()).run_all(&vm).await.unwrap_err();
    assert!(err.to_string().contains("b failed"), "{err}");
    let value = vm.run_string("reached").resolved().await.unwrap();
    assert_eq!(value, json!(["a"]));

    let stopper = vm.clone();
    tokio::task::spawn_blocking(move || stopper.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_install_runs_scripts_on_every_generation() {
    let dir = scripts_dir(&[(
        "boot.js",
        "var booted = (typeof booted === 'number' ? booted : 0) + 1;",
    )]);
    let vm = Vm::new(VmConfig::default());
    ScriptManager::new(dir.path()).install(&vm);

    vm.start().unwrap();
    assert_eq!(vm.run_string("booted").wait().unwrap(), json!(1));
    vm.shutdown().unwrap();

    vm.start().unwrap();
    assert_eq!(vm.run_string("booted").wait().unwrap(), json!(1));
    vm.shutdown().unwrap();
}
