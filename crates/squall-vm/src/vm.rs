//! The public face of the VM.
//!
//! A [`Vm`] ties a [`Scheduler`] to a module [`Registry`] and turns source
//! text into [`AsyncResult`]s. It is cheap to clone and can be shared freely
//! across threads; all interpreter access still goes through the scheduler.

use crate::compile::{Program, Transform, compile};
use crate::config::{PollBackoff, VmConfig};
use crate::error::{VmError, VmResult};
use crate::interpreter::{Interpreter, ValueRef};
use crate::modules::{Module, Registry, SourceFs};
use crate::result::{AsyncResult, Completion};
use crate::scheduler::{
    InitHook, Job, Scheduler, SchedulerStatsSnapshot, execute_with_panic_handler,
};
use crate::transform::typescript_transformer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, debug_span};

/// Builder for a [`Vm`] with custom configuration
#[derive(Default)]
pub struct VmBuilder {
    config: VmConfig,
    hooks: Vec<InitHook>,
    transform: Option<Transform>,
    fs: Option<Arc<dyn SourceFs>>,
    modules: Vec<Module>,
}

impl VmBuilder {
    /// Replace the whole configuration
    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Base directory for `require`
    pub fn modules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.modules_path = path.into();
        self
    }

    /// Add a runtime init hook, run on every new interpreter in the order
    /// added
    pub fn init_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Interpreter) -> VmResult<()> + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Transform applied to sources that fail to parse
    pub fn transformer<F>(mut self, transform: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Strip TypeScript syntax from sources that fail to parse
    pub fn typescript(mut self) -> Self {
        self.transform = Some(typescript_transformer());
        self
    }

    /// Read module sources through `fs` instead of the OS filesystem
    pub fn source_fs(mut self, fs: Arc<dyn SourceFs>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Pre-register a named module
    pub fn module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    /// Build the VM. It is not started.
    pub fn build(self) -> Vm {
        let registry = match self.fs {
            Some(fs) => Registry::with_fs(&self.config.modules_path, fs),
            None => Registry::new(&self.config.modules_path),
        };
        registry.set_transform(self.transform);
        for module in self.modules {
            registry.set_module(module);
        }
        let registry = Arc::new(registry);

        let scheduler = Scheduler::new(self.config.clone(), registry.clone());
        for hook in self.hooks {
            scheduler.on_runtime_init(hook);
        }

        Vm {
            inner: Arc::new(VmInner {
                config: self.config,
                scheduler,
                registry,
            }),
        }
    }
}

struct VmInner {
    config: VmConfig,
    scheduler: Scheduler,
    registry: Arc<Registry>,
}

/// Concurrency-safe handle to one embedded interpreter
///
/// ```no_run
/// use squall_vm::Vm;
///
/// let vm = Vm::new(Default::default());
/// vm.start().unwrap();
/// let value = vm.run_string("10 + 5").wait().unwrap();
/// assert_eq!(value, serde_json::json!(15));
/// vm.shutdown().unwrap();
/// ```
#[derive(Clone)]
pub struct Vm {
    inner: Arc<VmInner>,
}

impl Vm {
    /// Create a VM with the given configuration
    pub fn new(config: VmConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Create a builder for custom configuration
    pub fn builder() -> VmBuilder {
        VmBuilder::default()
    }

    pub fn config(&self) -> &VmConfig {
        &self.inner.config
    }

    /// Start the scheduler. Starting a running VM is a no-op.
    pub fn start(&self) -> VmResult<()> {
        match self.inner.scheduler.start() {
            Err(VmError::AlreadyRunning) => Ok(()),
            other => other,
        }
    }

    /// Stop the scheduler. Stopping a stopped VM is a no-op.
    pub fn shutdown(&self) -> VmResult<()> {
        match self.inner.scheduler.stop() {
            Err(VmError::NotRunning) => Ok(()),
            other => other,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.inner.scheduler.stats()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Submit a job against the interpreter. Returns false when the job was
    /// discarded because the VM is not running.
    pub fn run<F>(&self, job: F) -> bool
    where
        F: FnOnce(&Interpreter) + Send + 'static,
    {
        self.inner.scheduler.run(Box::new(job) as Job)
    }

    /// Ask the interpreter to abort whatever it is running.
    pub fn interrupt(&self, reason: impl Into<String>) {
        self.inner.scheduler.interrupt(reason);
    }

    /// Compile a script, using the registry's transform as a fallback.
    pub fn compile(&self, name: &str, source: &str) -> VmResult<Program> {
        compile(name, source, self.inner.registry.transform().as_ref())
    }

    /// Run anonymous source text.
    pub fn run_string(&self, source: &str) -> AsyncResult {
        self.run_script("<eval>", source)
    }

    /// Run named source text.
    pub fn run_script(&self, name: &str, source: &str) -> AsyncResult {
        match self.compile(name, source) {
            Ok(program) => self.run_program(&program),
            Err(e) => AsyncResult::failed(e),
        }
    }

    /// Run a compiled program and follow its value through promise
    /// settlement.
    pub fn run_program(&self, program: &Program) -> AsyncResult {
        let sender = self.inner.scheduler.sender();
        let inner = Completion::<ValueRef>::new(sender.done());

        let completion = inner.clone();
        let program = program.clone();
        let submitted = sender.submit(Box::new(move |interpreter: &Interpreter| {
            let _span = debug_span!("run", script = program.name()).entered();
            let result = execute_with_panic_handler(|| interpreter.eval_retained(&program));
            let retained = result.as_ref().ok().cloned();
            if !completion.resolve(result) {
                if let Some(value) = retained {
                    interpreter.remove_global(value.name());
                }
            }
        }));
        if !submitted {
            debug!("VM is not running, script discarded");
        }

        AsyncResult::spawn(inner, sender, PollBackoff::from(&self.inner.config))
    }

    /// Pre-register a named module.
    pub fn set_module(&self, module: Module) {
        self.inner.registry.set_module(module);
    }

    /// Replace the transform used when sources fail to parse.
    pub fn set_transformer<F>(&self, transform: F)
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.inner.registry.set_transform(Some(Arc::new(transform)));
    }

    /// Add a hook run after the existing ones on every new interpreter.
    pub fn on_runtime_init<F>(&self, hook: F)
    where
        F: Fn(&Interpreter) -> VmResult<()> + Send + Sync + 'static,
    {
        self.inner.scheduler.on_runtime_init(Arc::new(hook));
    }

    /// Add a hook run before the existing ones on every new interpreter.
    pub fn prepend_runtime_init<F>(&self, hook: F)
    where
        F: Fn(&Interpreter) -> VmResult<()> + Send + Sync + 'static,
    {
        self.inner.scheduler.prepend_runtime_init(Arc::new(hook));
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("running", &self.is_running())
            .field("registry", &self.inner.registry)
            .finish()
    }
}
