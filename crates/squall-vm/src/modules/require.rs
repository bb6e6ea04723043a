//! The `require` function and the `Registry` global.

use super::{Module, Registry};
use crate::error::{VmError, VmResult};
use crate::interpreter::{Interpreter, script_options};
use rquickjs::function::Rest;
use rquickjs::{Array, Coerced, Ctx, Exception, FromJs, Function, Object, Value};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

/// Exports of every module evaluated in the current interpreter, by key.
const EXPORTS_TABLE: &str = "__squall_exports";

impl Registry {
    /// Install `require` and the `Registry` global into a fresh interpreter.
    pub fn enable(self: &Arc<Self>, interpreter: &Interpreter) -> VmResult<()> {
        self.reset();
        let generation = interpreter.generation();
        interpreter.with(|ctx| -> VmResult<()> {
            let globals = ctx.globals();
            globals.set(EXPORTS_TABLE, Object::new(ctx.clone())?)?;

            let main = self.main().clone();
            let require = make_require(&ctx, self.clone(), main, Rc::default(), generation)?;
            globals.set("require", require)?;
            globals.set("Registry", registry_object(&ctx, self.clone())?)?;
            Ok(())
        })?;
        debug!(generation, base_path = %self.base_path().display(), "Module registry enabled");
        Ok(())
    }
}

/// A `require` bound to `parent`. `ancestors` holds the keys of the modules
/// whose evaluation is in progress along this require chain.
fn make_require<'js>(
    ctx: &Ctx<'js>,
    registry: Arc<Registry>,
    parent: Arc<Module>,
    ancestors: Rc<Vec<String>>,
    generation: u64,
) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            require(&ctx, &registry, &parent, &ancestors, generation, args.0)
        },
    )
}

fn require<'js>(
    ctx: &Ctx<'js>,
    registry: &Arc<Registry>,
    parent: &Arc<Module>,
    ancestors: &Rc<Vec<String>>,
    generation: u64,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let [specifier] = args.as_slice() else {
        let err = VmError::InvalidRequire(format!(
            "require expects exactly one argument, got {}",
            args.len()
        ));
        return Err(throw(ctx, &err));
    };
    let specifier = Coerced::<String>::from_js(ctx, specifier.clone())?.0;
    if specifier.trim().is_empty() {
        let err = VmError::InvalidRequire("require argument cannot be blank".to_string());
        return Err(throw(ctx, &err));
    }

    let module = registry
        .resolve(parent, &specifier)
        .map_err(|e| throw(ctx, &e))?;
    let key = module.key().to_string();

    let exports_table: Object = ctx.globals().get(EXPORTS_TABLE)?;
    // `undefined` and `null` are valid exports, so presence is checked by key.
    if module.evaluated_in() == generation && exports_table.contains_key(key.as_str())? {
        trace!(module = %key, "Returning cached exports");
        return exports_table.get(key.as_str());
    }

    let program = registry
        .compile_module(&module)
        .map_err(|e| throw(ctx, &e))?;

    if ancestors.contains(&key) {
        return Err(throw(ctx, &VmError::RequireLoop(key)));
    }

    debug!(module = %key, requested = %specifier, "Evaluating module");
    let wrapper: Function = ctx.eval_with_options(program.source(), script_options())?;

    let mut chain = Vec::with_capacity(ancestors.len() + 1);
    chain.extend(ancestors.iter().cloned());
    chain.push(key.clone());
    let child = make_require(ctx, registry.clone(), module.clone(), Rc::new(chain), generation)?;

    let module_object = Object::new(ctx.clone())?;
    let exports = Object::new(ctx.clone())?;
    module_object.set("exports", exports.clone())?;
    wrapper.call::<_, Value>((child, module_object.clone(), exports))?;

    let exports: Value = module_object.get("exports")?;
    exports_table.set(key.as_str(), exports.clone())?;
    module.mark_evaluated(generation);
    Ok(exports)
}

/// The `Registry` global: `setModule(name, body)` and `modules()`.
fn registry_object<'js>(ctx: &Ctx<'js>, registry: Arc<Registry>) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;

    let reg = registry.clone();
    object.set(
        "setModule",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: Value<'js>, body: Value<'js>| -> rquickjs::Result<()> {
                let name = Coerced::<String>::from_js(&ctx, name)?.0;
                if name.trim().is_empty() {
                    let err = VmError::InvalidRequire("module name cannot be blank".to_string());
                    return Err(throw(&ctx, &err));
                }
                let body = Coerced::<String>::from_js(&ctx, body)?.0;
                reg.set_module(Module::new(name, body));
                Ok(())
            },
        )?,
    )?;

    object.set(
        "modules",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Array<'js>> {
            let keys = Array::new(ctx.clone())?;
            for (i, key) in registry.modules().into_iter().enumerate() {
                keys.set(i, key)?;
            }
            Ok(keys)
        })?,
    )?;

    Ok(object)
}

/// Throw a registry error into the script that called `require`.
fn throw(ctx: &Ctx<'_>, err: &VmError) -> rquickjs::Error {
    let message = err.to_string();
    match err {
        VmError::InvalidRequire(_) => Exception::throw_type(ctx, &message),
        VmError::Syntax { .. } => Exception::throw_syntax(ctx, &message),
        _ => Exception::throw_message(ctx, &message),
    }
}
