//! A reference-counted host object runtime.
//!
//! Models the object system a bridged interpreter is embedded in: counted
//! references, built-in container kinds, callables, extension objects and
//! exceptions surfaced as `HostError`.

pub mod error;
pub mod key;
pub mod object;

pub use error::{HostError, HostErrorKind, HostResult};
pub use key::HostKey;
pub use object::{
    live_objects, HostCallable, HostFunction, HostInt, HostObject, HostRef, NativeObject,
};
