//! Sandboxed rhai interpreters exposed to a reference-counted host runtime.
//!
//! Each [`InstanceRef`] owns one interpreter environment: a globals namespace
//! plus optional `print` and `load` hooks supplied by the host. Values cross
//! the boundary through [`codec`]; failures carry the path to the offending
//! subvalue.

pub mod codec;
pub mod dispatch;
pub mod instance;
pub mod registry;
pub mod state;

mod interpreter;
mod resolve;
mod rhai_bridge;

pub use codec::{host_to_namespace, host_to_script, namespace_to_host, script_to_host};
pub use dispatch::{invoke_load, invoke_print};
pub use instance::{BridgedInstance, InstanceOptions, InstanceRef};
pub use registry::{HandleRegistry, InstanceHandle};
pub use sb_core::{configure, global_config, BridgeError, ResolverConfig};
pub use state::{InstanceState, MAKE_STRUCT};
