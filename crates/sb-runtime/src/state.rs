use indexmap::IndexMap;
use parking_lot::RwLock;
use sb_core::{BridgeError, Namespace, ResolverConfig, ScriptValue};
use sb_host::HostRef;
use tracing::trace;

use crate::resolve::FunctionSource;

/// Name of the predeclared struct constructor every instance starts with.
pub const MAKE_STRUCT: &str = "make_struct";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookSlot {
    Print,
    Load,
}

impl HookSlot {
    fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Load => "load",
        }
    }
}

pub(crate) fn ensure_callable(slot: HookSlot, hook: &HostRef) -> Result<(), BridgeError> {
    if hook.is_callable() {
        return Ok(());
    }
    Err(BridgeError::type_contract(format!(
        "{} hook must be callable, not {}",
        slot.name(),
        hook.type_name()
    )))
}

#[derive(Debug)]
struct StateFields {
    globals: Namespace,
    /// Source of the script functions bound in `globals`, by name.
    functions: IndexMap<String, Vec<FunctionSource>>,
    print: Option<HostRef>,
    load: Option<HostRef>,
    config: ResolverConfig,
}

impl StateFields {
    /// Sources of the functions whose names are still bound to them.
    fn live_functions(&self) -> Vec<FunctionSource> {
        self.functions
            .iter()
            .filter(|(name, _)| {
                matches!(self.globals.get(name.as_str()), Some(ScriptValue::Function(_)))
            })
            .flat_map(|(_, sources)| sources.iter().cloned())
            .collect()
    }
}

/// Everything an evaluation reads, taken under one read lock.
#[derive(Debug)]
pub(crate) struct EvalSnapshot {
    pub globals: Namespace,
    pub functions: Vec<FunctionSource>,
    pub print: Option<HostRef>,
    pub load: Option<HostRef>,
    pub config: ResolverConfig,
}

/// Names one `exec` declared or changed, merged back into the instance.
/// Globals the script left alone are not part of it.
#[derive(Debug)]
pub(crate) struct ExecOutcome {
    pub globals: Namespace,
    pub functions: IndexMap<String, Vec<FunctionSource>>,
}

/// Mutable record behind one bridged instance. Every field is read or
/// written under `fields`; host references handed out are always new counts.
#[derive(Debug)]
pub struct InstanceState {
    fields: RwLock<StateFields>,
}

impl InstanceState {
    pub fn new(config: ResolverConfig) -> Self {
        let mut globals = Namespace::new();
        globals.insert(
            MAKE_STRUCT.to_string(),
            ScriptValue::Function(MAKE_STRUCT.to_string()),
        );
        Self {
            fields: RwLock::new(StateFields {
                globals,
                functions: IndexMap::new(),
                print: None,
                load: None,
                config,
            }),
        }
    }

    pub fn config(&self) -> ResolverConfig {
        self.fields.read().config
    }

    pub fn globals(&self) -> Namespace {
        self.fields.read().globals.clone()
    }

    pub fn global(&self, name: &str) -> Option<ScriptValue> {
        self.fields.read().globals.get(name).cloned()
    }

    /// Merges `globals` into the namespace; existing names are rebound.
    pub fn update_globals(&self, globals: Namespace) {
        let mut fields = self.fields.write();
        trace!(count = globals.len(), "updating globals");
        fields.globals.extend(globals);
    }

    pub fn pop_global(&self, name: &str) -> Option<ScriptValue> {
        let mut fields = self.fields.write();
        let value = fields.globals.shift_remove(name);
        if value.is_some() {
            fields.functions.shift_remove(name);
        }
        value
    }

    pub fn print_hook(&self) -> Option<HostRef> {
        self.hook(HookSlot::Print)
    }

    pub fn load_hook(&self) -> Option<HostRef> {
        self.hook(HookSlot::Load)
    }

    /// Host `None` clears the hook. Anything else must be callable; on
    /// failure nothing changes.
    pub fn set_print_hook(&self, hook: &HostRef) -> Result<(), BridgeError> {
        self.set_hook(HookSlot::Print, hook)
    }

    pub fn set_load_hook(&self, hook: &HostRef) -> Result<(), BridgeError> {
        self.set_hook(HookSlot::Load, hook)
    }

    fn hook(&self, slot: HookSlot) -> Option<HostRef> {
        let fields = self.fields.read();
        let hook = match slot {
            HookSlot::Print => fields.print.as_ref(),
            HookSlot::Load => fields.load.as_ref(),
        };
        hook.map(HostRef::new_ref)
    }

    fn set_hook(&self, slot: HookSlot, hook: &HostRef) -> Result<(), BridgeError> {
        let replacement = if hook.is_none() {
            None
        } else {
            ensure_callable(slot, hook)?;
            Some(hook.new_ref())
        };
        let previous = {
            let mut fields = self.fields.write();
            let field = match slot {
                HookSlot::Print => &mut fields.print,
                HookSlot::Load => &mut fields.load,
            };
            std::mem::replace(field, replacement)
        };
        trace!(slot = slot.name(), replaced = previous.is_some(), "hook assigned");
        // the previous hook is released here, outside the lock
        drop(previous);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> EvalSnapshot {
        let fields = self.fields.read();
        EvalSnapshot {
            globals: fields.globals.clone(),
            functions: fields.live_functions(),
            print: fields.print.as_ref().map(HostRef::new_ref),
            load: fields.load.as_ref().map(HostRef::new_ref),
            config: fields.config,
        }
    }

    /// Globals and function sources as a loading script sees them, read
    /// under one lock.
    pub(crate) fn exports(&self) -> (Namespace, Vec<FunctionSource>) {
        let fields = self.fields.read();
        (fields.globals.clone(), fields.live_functions())
    }

    pub(crate) fn commit(&self, outcome: ExecOutcome) {
        let mut fields = self.fields.write();
        trace!(
            globals = outcome.globals.len(),
            functions = outcome.functions.len(),
            "committing exec outcome"
        );
        fields.globals.extend(outcome.globals);
        fields.functions.extend(outcome.functions);
    }

    /// Releases the held hooks. Takes `self` by value: nothing else can be
    /// using the state any more, so no lock is taken.
    pub(crate) fn teardown(self) {
        let fields = self.fields.into_inner();
        trace!(
            print = fields.print.is_some(),
            load = fields.load.is_some(),
            "releasing instance state"
        );
        drop(fields);
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;
    use crate::resolve::function_definitions;

    fn noop_hook() -> HostRef {
        HostRef::function("hook", |_| Ok(HostRef::none()))
    }

    #[test]
    fn new_state_predeclares_make_struct() {
        let state = InstanceState::new(ResolverConfig::default());
        assert_eq!(
            state.global(MAKE_STRUCT),
            Some(ScriptValue::Function(MAKE_STRUCT.to_string()))
        );
        assert!(state.print_hook().is_none());
        assert!(state.load_hook().is_none());
    }

    #[test]
    fn hooks_are_handed_out_as_new_references() {
        let state = InstanceState::new(ResolverConfig::default());
        let hook = noop_hook();
        state.set_print_hook(&hook).expect("callable");
        assert_eq!(hook.ref_count(), 2);

        let fetched = state.print_hook().expect("hook");
        assert!(fetched.ptr_eq(&hook));
        assert_eq!(hook.ref_count(), 3);
        drop(fetched);
        assert_eq!(hook.ref_count(), 2);
    }

    #[test]
    fn rejected_hook_leaves_state_unchanged() {
        let state = InstanceState::new(ResolverConfig::default());
        let hook = noop_hook();
        state.set_load_hook(&hook).expect("callable");

        let error = state
            .set_load_hook(&HostRef::int(3))
            .expect_err("int is not callable");
        assert_eq!(error.code(), "BRIDGE_TYPE_CONTRACT");
        assert_eq!(error.to_string(), "load hook must be callable, not int");
        assert!(state.load_hook().expect("still set").ptr_eq(&hook));
    }

    #[test]
    fn none_clears_and_releases_the_hook() {
        let state = InstanceState::new(ResolverConfig::default());
        let hook = noop_hook();
        state.set_print_hook(&hook).expect("callable");
        state.set_print_hook(&HostRef::none()).expect("clear");
        assert!(state.print_hook().is_none());
        assert_eq!(hook.ref_count(), 1);
    }

    #[test]
    fn popping_a_function_forgets_its_source() {
        let state = InstanceState::new(ResolverConfig::default());
        let functions = function_definitions("fn twice(x) { x * 2 }", "lib.star");
        let mut globals = Namespace::new();
        globals.insert("twice".to_string(), ScriptValue::Function("twice".to_string()));
        state.commit(ExecOutcome { globals, functions });
        assert_eq!(state.snapshot().functions.len(), 1);

        assert!(state.pop_global("twice").is_some());
        assert!(state.snapshot().functions.is_empty());
        assert!(state.pop_global("twice").is_none());
    }

    #[test]
    fn rebinding_a_function_name_hides_its_source() {
        let state = InstanceState::new(ResolverConfig::default());
        let functions = function_definitions("fn f() { 1 }", "lib.star");
        let mut globals = Namespace::new();
        globals.insert("f".to_string(), ScriptValue::Function("f".to_string()));
        state.commit(ExecOutcome { globals, functions });

        let mut rebound = Namespace::new();
        rebound.insert("f".to_string(), ScriptValue::int(1));
        state.update_globals(rebound);
        assert!(state.snapshot().functions.is_empty());
    }

    #[test]
    fn teardown_releases_hooks() {
        let state = InstanceState::new(ResolverConfig::default());
        let print = noop_hook();
        let load = noop_hook();
        state.set_print_hook(&print).expect("print");
        state.set_load_hook(&load).expect("load");
        state.teardown();
        assert_eq!(print.ref_count(), 1);
        assert_eq!(load.ref_count(), 1);
    }
}
