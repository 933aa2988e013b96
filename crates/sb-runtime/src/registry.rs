use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use sb_core::BridgeError;
use tracing::trace;

use crate::state::InstanceState;

/// Generation-checked index into a [`HandleRegistry`]. A handle outlives its
/// state harmlessly: lookups after removal fail instead of aliasing the
/// slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    index: usize,
    generation: u64,
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u64,
    state: Option<Arc<InstanceState>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Default)]
pub struct HandleRegistry {
    slots: RwLock<Slots>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry every bridged instance is stored in.
    pub fn global() -> &'static HandleRegistry {
        static GLOBAL: OnceLock<HandleRegistry> = OnceLock::new();
        GLOBAL.get_or_init(HandleRegistry::new)
    }

    pub fn insert(&self, state: InstanceState) -> InstanceHandle {
        let mut slots = self.slots.write();
        let state = Some(Arc::new(state));
        let handle = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.entries[index];
                slot.state = state;
                InstanceHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                slots.entries.push(Slot {
                    generation: 0,
                    state,
                });
                InstanceHandle {
                    index: slots.entries.len() - 1,
                    generation: 0,
                }
            }
        };
        trace!(%handle, "handle issued");
        handle
    }

    pub fn get(&self, handle: InstanceHandle) -> Result<Arc<InstanceState>, BridgeError> {
        let slots = self.slots.read();
        slots
            .entries
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.state.clone())
            .ok_or_else(|| stale(handle))
    }

    /// Invalidates `handle` and hands back its state. A second removal of the
    /// same handle fails.
    pub fn remove(&self, handle: InstanceHandle) -> Result<Arc<InstanceState>, BridgeError> {
        let mut slots = self.slots.write();
        let slot = slots
            .entries
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation && slot.state.is_some())
            .ok_or_else(|| stale(handle))?;
        let state = slot.state.take().ok_or_else(|| stale(handle))?;
        slot.generation += 1;
        slots.free.push(handle.index);
        trace!(%handle, "handle invalidated");
        Ok(state)
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.read();
        slots.entries.len() - slots.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stale(handle: InstanceHandle) -> BridgeError {
    BridgeError::StateAccess {
        handle: handle.to_string(),
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use sb_core::ResolverConfig;

    fn state() -> InstanceState {
        InstanceState::new(ResolverConfig::default())
    }

    #[test]
    fn handles_resolve_until_removed() {
        let registry = HandleRegistry::new();
        let handle = registry.insert(state());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(handle).is_ok());

        registry.remove(handle).expect("first removal");
        assert!(registry.is_empty());
        let error = registry.get(handle).expect_err("stale");
        assert_eq!(error.code(), "BRIDGE_STATE_ACCESS");
        assert_eq!(error.to_string(), "instance handle #0.0 is not live");
    }

    #[test]
    fn double_removal_is_detected() {
        let registry = HandleRegistry::new();
        let handle = registry.insert(state());
        registry.remove(handle).expect("first removal");
        assert!(registry.remove(handle).is_err());
    }

    #[test]
    fn reused_slot_does_not_alias_stale_handle() {
        let registry = HandleRegistry::new();
        let old = registry.insert(state());
        registry.remove(old).expect("remove");

        let new = registry.insert(state());
        assert_eq!(new.to_string(), "#0.1");
        assert!(registry.get(old).is_err());
        assert!(registry.get(new).is_ok());
        assert!(registry.remove(old).is_err());
        assert_eq!(registry.len(), 1);
    }
}
