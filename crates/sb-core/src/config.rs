use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Resolver permissiveness for one interpreter instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Whether the `set(...)` constructor may be used.
    pub allow_set: bool,
    /// Whether existing globals may be re-bound.
    pub allow_global_reassign: bool,
    /// Whether functions may call themselves, directly or through others.
    pub allow_recursion: bool,
}

impl ResolverConfig {
    pub fn permissive() -> Self {
        Self {
            allow_set: true,
            allow_global_reassign: true,
            allow_recursion: true,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn apply(
        self,
        allow_set: Toggle,
        allow_global_reassign: Toggle,
        allow_recursion: Toggle,
    ) -> Self {
        Self {
            allow_set: allow_set.apply(self.allow_set),
            allow_global_reassign: allow_global_reassign.apply(self.allow_global_reassign),
            allow_recursion: allow_recursion.apply(self.allow_recursion),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Set,
    Clear,
    Keep,
}

impl Toggle {
    /// `0` clears, `1` sets, anything else leaves the current value.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::Clear,
            1 => Self::Set,
            _ => Self::Keep,
        }
    }

    pub fn apply(self, current: bool) -> bool {
        match self {
            Self::Set => true,
            Self::Clear => false,
            Self::Keep => current,
        }
    }
}

static ALLOW_SET: AtomicBool = AtomicBool::new(false);
static ALLOW_GLOBAL_REASSIGN: AtomicBool = AtomicBool::new(false);
static ALLOW_RECURSION: AtomicBool = AtomicBool::new(false);

/// Process-wide defaults picked up by instances created without an explicit
/// `ResolverConfig`. Last writer wins; configure before the first evaluation.
pub fn configure(allow_set: i64, allow_global_reassign: i64, allow_recursion: i64) {
    for (flag, raw) in [
        (&ALLOW_SET, allow_set),
        (&ALLOW_GLOBAL_REASSIGN, allow_global_reassign),
        (&ALLOW_RECURSION, allow_recursion),
    ] {
        let toggle = Toggle::from_raw(raw);
        if toggle != Toggle::Keep {
            flag.store(toggle.apply(false), Ordering::Relaxed);
        }
    }
}

pub fn global_config() -> ResolverConfig {
    ResolverConfig {
        allow_set: ALLOW_SET.load(Ordering::Relaxed),
        allow_global_reassign: ALLOW_GLOBAL_REASSIGN.load(Ordering::Relaxed),
        allow_recursion: ALLOW_RECURSION.load(Ordering::Relaxed),
    }
}
