use std::any::Any;
use std::sync::Arc;

use sb_core::{global_config, BridgeError, ResolverConfig};
use sb_host::{HostError, HostObject, HostRef, NativeObject};
use tracing::{debug, error};

use crate::codec::{host_to_namespace, namespace_to_host, script_to_host};
use crate::dispatch::resolve_hook;
use crate::interpreter;
use crate::registry::{HandleRegistry, InstanceHandle};
use crate::state::{HookSlot, InstanceState};

/// The native host object behind every bridged interpreter. It owns exactly
/// one registry handle, released when the last host reference goes away.
pub struct BridgedInstance {
    handle: InstanceHandle,
}

impl BridgedInstance {
    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub(crate) fn state(&self) -> Result<Arc<InstanceState>, BridgeError> {
        HandleRegistry::global().get(self.handle)
    }
}

impl NativeObject for BridgedInstance {
    fn type_name(&self) -> &'static str {
        "Interpreter"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for BridgedInstance {
    fn drop(&mut self) {
        match HandleRegistry::global().remove(self.handle) {
            Ok(state) => {
                debug!(handle = %self.handle, "tearing down instance");
                match Arc::try_unwrap(state) {
                    Ok(state) => state.teardown(),
                    // a concurrent load is still reading the globals; the
                    // state goes away with its last reader
                    Err(state) => drop(state),
                }
            }
            Err(failure) => {
                error!(handle = %self.handle, %failure, "instance torn down twice");
                panic!("instance {} torn down twice", self.handle);
            }
        }
    }
}

/// Construction arguments for [`InstanceRef::new`]. Validated in field order
/// `print`, `load`, `globals`.
#[derive(Default)]
pub struct InstanceOptions {
    pub globals: Option<HostRef>,
    pub print: Option<HostRef>,
    pub load: Option<HostRef>,
    /// Falls back to the process-wide configuration.
    pub config: Option<ResolverConfig>,
}

/// An owned host reference to a bridged instance.
pub struct InstanceRef {
    object: HostRef,
}

impl InstanceRef {
    pub fn new(options: InstanceOptions) -> Result<Self, BridgeError> {
        let config = options.config.unwrap_or_else(global_config);
        let handle = HandleRegistry::global().insert(InstanceState::new(config));
        let instance = Self {
            object: HostRef::native(BridgedInstance { handle }),
        };
        debug!(%handle, ?config, "instance created");

        if let Some(print) = &options.print {
            instance.set_print_hook(print)?;
        }
        if let Some(load) = &options.load {
            instance.set_load_hook(load)?;
        }
        if let Some(globals) = &options.globals {
            if !matches!(globals.object(), HostObject::Dict(_)) {
                return Err(BridgeError::type_contract(format!(
                    "Can't initialize globals from {}",
                    globals.type_name()
                )));
            }
            instance.set_globals(globals)?;
        }
        Ok(instance)
    }

    pub fn from_host(object: HostRef) -> Result<Self, BridgeError> {
        if object.downcast_native::<BridgedInstance>().is_none() {
            return Err(BridgeError::type_contract(format!(
                "expected Interpreter, got {}",
                object.type_name()
            )));
        }
        Ok(Self { object })
    }

    pub fn as_host(&self) -> &HostRef {
        &self.object
    }

    pub fn into_host(self) -> HostRef {
        self.object
    }

    pub fn new_ref(&self) -> Self {
        Self {
            object: self.object.new_ref(),
        }
    }

    pub fn handle(&self) -> Result<InstanceHandle, BridgeError> {
        Ok(self.native()?.handle())
    }

    fn native(&self) -> Result<&BridgedInstance, BridgeError> {
        self.object
            .downcast_native::<BridgedInstance>()
            .ok_or_else(|| {
                BridgeError::type_contract(format!(
                    "expected Interpreter, got {}",
                    self.object.type_name()
                ))
            })
    }

    fn state(&self) -> Result<Arc<InstanceState>, BridgeError> {
        self.native()?.state()
    }

    pub fn config(&self) -> Result<ResolverConfig, BridgeError> {
        Ok(self.state()?.config())
    }

    pub fn exec(&self, source: &str, filename: &str) -> Result<(), BridgeError> {
        self.exec_with_hooks(source, filename, None, None)
    }

    /// Runs `source` with per-call hook overrides. An override of host `None`
    /// disables that hook for this call only.
    pub fn exec_with_hooks(
        &self,
        source: &str,
        filename: &str,
        print: Option<&HostRef>,
        load: Option<&HostRef>,
    ) -> Result<(), BridgeError> {
        let state = self.state()?;
        let mut snapshot = state.snapshot();
        snapshot.print = resolve_hook(HookSlot::Print, print, snapshot.print.take())?;
        snapshot.load = resolve_hook(HookSlot::Load, load, snapshot.load.take())?;
        let outcome = interpreter::exec(&snapshot, source, filename)?;
        state.commit(outcome);
        Ok(())
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<HostRef, BridgeError> {
        self.eval_with_hooks(source, filename, None, None)
    }

    pub fn eval_with_hooks(
        &self,
        source: &str,
        filename: &str,
        print: Option<&HostRef>,
        load: Option<&HostRef>,
    ) -> Result<HostRef, BridgeError> {
        let state = self.state()?;
        let mut snapshot = state.snapshot();
        snapshot.print = resolve_hook(HookSlot::Print, print, snapshot.print.take())?;
        snapshot.load = resolve_hook(HookSlot::Load, load, snapshot.load.take())?;
        let value = interpreter::eval(&snapshot, source, filename)?;
        Ok(script_to_host(&value)?)
    }

    /// The globals as a new host dict. Interpreter functions are left out.
    pub fn get_globals(&self) -> Result<HostRef, BridgeError> {
        let globals = self.state()?.globals();
        Ok(namespace_to_host(&globals)?)
    }

    /// Merges the entries of a host dict into the globals.
    pub fn set_globals(&self, globals: &HostRef) -> Result<(), BridgeError> {
        let namespace = host_to_namespace(globals)?;
        self.state()?.update_globals(namespace);
        Ok(())
    }

    pub fn get_global(&self, name: &str, default: Option<&HostRef>) -> Result<HostRef, BridgeError> {
        match self.state()?.global(name) {
            Some(value) => Ok(script_to_host(&value)?),
            None => default.map(HostRef::new_ref).ok_or_else(|| missing(name)),
        }
    }

    pub fn pop_global(&self, name: &str, default: Option<&HostRef>) -> Result<HostRef, BridgeError> {
        match self.state()?.pop_global(name) {
            Some(value) => Ok(script_to_host(&value)?),
            None => default.map(HostRef::new_ref).ok_or_else(|| missing(name)),
        }
    }

    /// A new reference to the print hook, or host `None`.
    pub fn print_hook(&self) -> Result<HostRef, BridgeError> {
        Ok(self.state()?.print_hook().unwrap_or_else(HostRef::none))
    }

    pub fn set_print_hook(&self, hook: &HostRef) -> Result<(), BridgeError> {
        self.state()?.set_print_hook(hook)
    }

    /// A new reference to the load hook, or host `None`.
    pub fn load_hook(&self) -> Result<HostRef, BridgeError> {
        Ok(self.state()?.load_hook().unwrap_or_else(HostRef::none))
    }

    pub fn set_load_hook(&self, hook: &HostRef) -> Result<(), BridgeError> {
        self.state()?.set_load_hook(hook)
    }
}

fn missing(name: &str) -> BridgeError {
    BridgeError::HostPropagated(HostError::key_error(format!("'{}'", name)))
}
