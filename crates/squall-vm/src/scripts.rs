//! Directory of scripts run against a VM.

use crate::compile::compile;
use crate::error::VmResult;
use crate::interpreter::Interpreter;
use crate::vm::Vm;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A script loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// File name, relative to the scripts directory
    pub name: String,
    pub body: String,
}

/// Loads the `*.js` files of one directory.
#[derive(Debug, Clone)]
pub struct ScriptManager {
    root: PathBuf,
}

impl ScriptManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read every `*.js` file directly inside the directory, sorted by name.
    /// Subdirectories are skipped.
    pub fn load_all(&self) -> VmResult<Vec<Script>> {
        load_dir(&self.root)
    }

    /// Run every script on `vm` in name order, waiting for each to settle.
    /// Stops at the first failure.
    pub async fn run_all(&self, vm: &Vm) -> VmResult<()> {
        for script in self.load_all()? {
            info!(script = %script.name, "Running script");
            vm.run_script(&script.name, &script.body).resolved().await?;
        }
        Ok(())
    }

    /// Run the scripts on every new interpreter, as part of its
    /// initialization. Failures are logged; a script that does not compile
    /// stops the remaining ones from running.
    pub fn install(&self, vm: &Vm) {
        let root = self.root.clone();
        let registry = vm.registry().clone();
        vm.on_runtime_init(move |interpreter: &Interpreter| {
            info!(path = %root.display(), "Loading scripts");
            let scripts = match load_dir(&root) {
                Ok(scripts) => scripts,
                Err(e) => {
                    warn!(error = %e, "Error loading scripts at runtime init");
                    return Ok(());
                }
            };
            for script in scripts {
                info!(script = %script.name, "Running script");
                let program =
                    match compile(&script.name, &script.body, registry.transform().as_ref()) {
                        Ok(program) => program,
                        Err(e) => {
                            warn!(script = %script.name, error = %e, "Error compiling script");
                            return Ok(());
                        }
                    };
                let result = interpreter.with(|ctx| interpreter.eval(&ctx, &program).map(|_| ()));
                if let Err(e) = result {
                    warn!(script = %script.name, error = %e, "Error running script");
                }
            }
            Ok(())
        });
    }
}

fn load_dir(root: &Path) -> VmResult<Vec<Script>> {
    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".js") {
            continue;
        }
        let body = std::fs::read_to_string(entry.path())?;
        scripts.push(Script { name, body });
    }
    scripts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmError;

    #[test]
    fn test_load_all_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.js"), "var b = 2;").unwrap();
        std::fs::write(dir.path().join("a.js"), "var a = 1;").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("lib.js")).unwrap();

        let scripts = ScriptManager::new(dir.path()).load_all().unwrap();
        let names: Vec<&str> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a.js", "b.js"]);
        assert_eq!(scripts[0].body, "var a = 1;");
    }

    #[test]
    fn test_missing_directory_is_an_io_error() {
        let err = ScriptManager::new("/definitely/not/here").load_all().unwrap_err();
        assert!(matches!(err, VmError::Io(_)));
    }
}
