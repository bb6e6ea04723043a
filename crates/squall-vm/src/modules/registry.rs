//! Module records and specifier resolution.

use super::{EntryKind, OsFs, SourceFs, clean_path};
use crate::compile::{Program, Transform, check_syntax};
use crate::error::{VmError, VmResult};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// The parts of `package.json` that resolution looks at.
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
}

/// A module known to the registry.
///
/// File modules are keyed by their cleaned path; modules registered with
/// [`Registry::set_module`] are keyed by name.
pub struct Module {
    key: String,
    name: String,
    path: PathBuf,
    main: String,
    body: String,
    root: Option<Arc<Module>>,
    program: Mutex<Option<Program>>,
    evaluated_in: AtomicU64,
}

impl Module {
    /// A named module with an inline body, for [`Registry::set_module`].
    ///
    /// Relative requires inside it resolve against the registry's base path
    /// unless [`Module::with_path`] says otherwise.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
            path: PathBuf::new(),
            main: "index.js".to_string(),
            body: body.into(),
            root: None,
            program: Mutex::new(None),
            evaluated_in: AtomicU64::new(0),
        }
    }

    /// Directory that relative requires resolve against.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    fn file(name: &str, file: &Path, body: String, root: Arc<Module>) -> Self {
        let path = file.parent().map(Path::to_path_buf).unwrap_or_default();
        let main = file
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            key: file.to_string_lossy().into_owned(),
            name: name.to_string(),
            path,
            main,
            body,
            root: Some(root),
            program: Mutex::new(None),
            evaluated_in: AtomicU64::new(0),
        }
    }

    fn directory(name: &str, path: PathBuf, main: String, root: Option<Arc<Module>>) -> Self {
        Self {
            key: path.to_string_lossy().into_owned(),
            name: name.to_string(),
            path,
            main,
            body: String::new(),
            root,
            program: Mutex::new(None),
            evaluated_in: AtomicU64::new(0),
        }
    }

    /// Cache key: the cleaned file path, the directory of a package or root
    /// module, or the registered name.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The specifier this module was first required as.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory containing the module.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the module's entry within [`Module::path`].
    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// The compiled wrapper, once the module has been required.
    pub fn program(&self) -> Option<Program> {
        self.program.lock().clone()
    }

    pub(crate) fn evaluated_in(&self) -> u64 {
        self.evaluated_in.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_evaluated(&self, generation: u64) {
        self.evaluated_in.store(generation, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("main", &self.main)
            .field("has_body", &!self.body.is_empty())
            .field("evaluated_in", &self.evaluated_in())
            .finish()
    }
}

/// Resolves, loads and caches CommonJS modules.
pub struct Registry {
    base_path: PathBuf,
    fs: Arc<dyn SourceFs>,
    modules: Mutex<HashMap<String, Arc<Module>>>,
    main: Arc<Module>,
    transform: Mutex<Option<Transform>>,
}

impl Registry {
    /// Registry rooted at `base_path`, reading from the OS filesystem.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self::with_fs(base_path, Arc::new(OsFs))
    }

    /// Registry rooted at `base_path`, reading through `fs`.
    ///
    /// A trailing `node_modules` component is stripped; packages are looked
    /// up in `<base_path>/node_modules`.
    pub fn with_fs(base_path: impl AsRef<Path>, fs: Arc<dyn SourceFs>) -> Self {
        let mut base_path = clean_path(base_path.as_ref());
        if base_path.file_name().is_some_and(|n| n == "node_modules") {
            base_path = base_path
                .parent()
                .map(Path::to_path_buf)
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from("."));
        }

        let node_modules = Arc::new(Module::directory(
            "node_modules",
            base_path.join("node_modules"),
            String::new(),
            None,
        ));
        let main = Arc::new(Module::directory(
            ".",
            base_path.clone(),
            String::new(),
            Some(node_modules),
        ));

        Self {
            base_path,
            fs,
            modules: Mutex::new(HashMap::new()),
            main,
            transform: Mutex::new(None),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The module top-level `require` calls resolve from.
    pub fn main(&self) -> &Arc<Module> {
        &self.main
    }

    /// Register a module under its name. Bare requires of that name resolve
    /// to it ahead of anything on disk.
    pub fn set_module(&self, module: Module) {
        let mut module = module;
        if module.path.as_os_str().is_empty() {
            module.path = self.base_path.clone();
        }
        debug!(name = %module.name, "Registering module");
        self.modules
            .lock()
            .insert(module.key.clone(), Arc::new(module));
    }

    /// Cached module by key.
    pub fn module(&self, key: &str) -> Option<Arc<Module>> {
        self.modules.lock().get(key).cloned()
    }

    /// Keys of every cached module, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.modules.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn set_transform(&self, transform: Option<Transform>) {
        *self.transform.lock() = transform;
    }

    pub fn transform(&self) -> Option<Transform> {
        self.transform.lock().clone()
    }

    /// Forget which modules were evaluated; a new interpreter has none of
    /// their exports.
    pub(crate) fn reset(&self) {
        for module in self.modules.lock().values() {
            module.mark_evaluated(0);
        }
    }

    /// Resolve `specifier` as required from `parent`.
    pub fn resolve(&self, parent: &Arc<Module>, specifier: &str) -> VmResult<Arc<Module>> {
        if specifier.starts_with("./") || specifier.starts_with("../") {
            self.resolve_relative(parent, specifier)
        } else {
            self.resolve_bare(parent, specifier)
        }
    }

    fn resolve_relative(&self, parent: &Arc<Module>, specifier: &str) -> VmResult<Arc<Module>> {
        let mut path = clean_path(&parent.path.join(specifier));
        if !has_js_extension(&path) {
            match self.fs.entry_kind(&path) {
                Ok(EntryKind::Dir) => path = path.join("index.js"),
                Ok(EntryKind::File) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => path = append_js(&path),
                Err(_) => {}
            }
        }

        let key = path.to_string_lossy().into_owned();
        if let Some(module) = self.modules.lock().get(&key) {
            trace!(module = %key, "Module cache hit");
            return Ok(module.clone());
        }

        let body = self
            .fs
            .read_to_string(&path)
            .map_err(|e| VmError::ModuleNotFound {
                specifier: specifier.to_string(),
                requester: parent.key.clone(),
                source: Arc::new(e),
            })?;
        debug!(module = %key, "Loaded module source");

        let module = Arc::new(Module::file(specifier, &path, body, parent.clone()));
        let mut modules = self.modules.lock();
        Ok(modules.entry(key).or_insert(module).clone())
    }

    fn resolve_bare(&self, at: &Arc<Module>, specifier: &str) -> VmResult<Arc<Module>> {
        if let Some(root) = &at.root {
            return self.resolve_bare(root, specifier);
        }
        if let Some(module) = self.modules.lock().get(specifier) {
            return Ok(module.clone());
        }

        let path = clean_path(&at.path.join(specifier));
        let (dir, main) = if has_js_extension(&path) {
            split_file(&path)
        } else {
            match self.fs.read_to_string(&path.join("package.json")) {
                Ok(text) => {
                    let manifest: Manifest =
                        serde_json::from_str(&text).map_err(|e| VmError::Manifest {
                            package: specifier.to_string(),
                            source: Arc::new(e),
                        })?;
                    let main = manifest
                        .main
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "index.js".to_string());
                    (path, main)
                }
                Err(_) => match self.fs.entry_kind(&path) {
                    Ok(EntryKind::Dir) => (path, "index.js".to_string()),
                    Ok(EntryKind::File) => split_file(&path),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => split_file(&append_js(&path)),
                    Err(e) => {
                        return Err(VmError::ModuleNotFound {
                            specifier: specifier.to_string(),
                            requester: at.key.clone(),
                            source: Arc::new(e),
                        });
                    }
                },
            }
        };

        let package = Arc::new(Module::directory(specifier, dir, main, Some(at.clone())));
        let entry = format!("./{}", package.main);
        self.resolve_relative(&package, &entry)
    }

    /// Compile the CommonJS wrapper of a module, once.
    ///
    /// When the body does not parse and a transform is set, the transformed
    /// body is wrapped and compiled instead.
    pub(crate) fn compile_module(&self, module: &Module) -> VmResult<Program> {
        let mut cached = module.program.lock();
        if let Some(program) = cached.as_ref() {
            return Ok(program.clone());
        }

        let mut source = wrap_module(&module.body);
        if let Err(err) = check_syntax(&module.key, &source) {
            let Some(transform) = self.transform() else {
                return Err(err);
            };
            debug!(module = %module.key, error = %err, "Parse failed, retrying with transform");
            let body = transform(&module.body).map_err(|e| VmError::Transform(format!("{e:#}")))?;
            source = wrap_module(&body);
            check_syntax(&module.key, &source)?;
        }

        let program = Program::new(module.key.clone(), source);
        *cached = Some(program.clone());
        Ok(program)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("base_path", &self.base_path)
            .field("modules", &self.modules.lock().len())
            .field("transform", &self.transform.lock().is_some())
            .finish()
    }
}

fn wrap_module(body: &str) -> String {
    format!("(function(require, module, exports) {{\n{body}\n}})")
}

fn has_js_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "js")
}

fn append_js(path: &Path) -> PathBuf {
    let mut file = path.as_os_str().to_owned();
    file.push(".js");
    PathBuf::from(file)
}

fn split_file(path: &Path) -> (PathBuf, String) {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, file)
}
