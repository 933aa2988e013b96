//! Value conversion across the interpreter/host boundary.

mod to_host;
mod to_script;

pub use to_host::{
    int_to_host, list_to_host, mapping_to_host, namespace_to_host, script_to_host, set_to_host,
    struct_to_host, tuple_to_host,
};
pub use to_script::{host_to_namespace, host_to_script};
