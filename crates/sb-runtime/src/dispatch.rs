//! Calls into host-provided `load` and `print` hooks on behalf of a running
//! script.

use sb_core::{BridgeError, Namespace, ScriptValue};
use sb_host::HostRef;
use tracing::debug;

use crate::codec::script_to_host;
use crate::instance::BridgedInstance;
use crate::resolve::FunctionSource;
use crate::state::{ensure_callable, HookSlot};

/// What a loaded instance exports to the importing script.
#[derive(Debug)]
pub(crate) struct LoadedModule {
    pub globals: Namespace,
    pub functions: Vec<FunctionSource>,
}

/// Calls `hook(filename, parent)` and returns the globals of the instance it
/// produced.
///
/// A hook that raises is reported as that exact host error. A hook that
/// returns anything other than a bridged instance is a type contract
/// violation.
pub fn invoke_load(
    hook: &HostRef,
    filename: &str,
    parent: Option<&str>,
) -> Result<Namespace, BridgeError> {
    load_module(hook, filename, parent).map(|module| module.globals)
}

pub(crate) fn load_module(
    hook: &HostRef,
    filename: &str,
    parent: Option<&str>,
) -> Result<LoadedModule, BridgeError> {
    let args = script_to_host(&ScriptValue::Tuple(vec![
        ScriptValue::string(filename),
        parent.map_or(ScriptValue::None, ScriptValue::string),
    ]))?;
    debug!(filename, parent = ?parent, "dispatching load hook");
    let result = hook.call(&args)?;
    drop(args);

    let Some(instance) = result.downcast_native::<BridgedInstance>() else {
        return Err(BridgeError::type_contract(format!(
            "load hook must return a bridged instance, got {}",
            result.type_name()
        )));
    };
    // the read lock on the loaded instance is released before returning
    let (globals, functions) = instance.state()?.exports();
    Ok(LoadedModule { globals, functions })
}

/// Calls `hook(message)` and discards its result. Without a hook the message
/// goes to standard output.
pub fn invoke_print(hook: Option<&HostRef>, message: &str) -> Result<(), BridgeError> {
    let Some(hook) = hook else {
        println!("{}", message);
        return Ok(());
    };
    let args = script_to_host(&ScriptValue::Tuple(vec![ScriptValue::string(message)]))?;
    debug!(len = message.len(), "dispatching print hook");
    hook.call(&args)?;
    Ok(())
}

/// Picks the hook for one call: an explicit override wins over the stored
/// hook, and an explicit host `None` disables the hook for that call.
pub(crate) fn resolve_hook(
    slot: HookSlot,
    explicit: Option<&HostRef>,
    stored: Option<HostRef>,
) -> Result<Option<HostRef>, BridgeError> {
    match explicit {
        None => Ok(stored),
        Some(hook) if hook.is_none() => Ok(None),
        Some(hook) => {
            ensure_callable(slot, hook)?;
            Ok(Some(hook.new_ref()))
        }
    }
}
