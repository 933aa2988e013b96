pub mod config;
pub mod error;
pub mod value;

pub use config::{configure, global_config, ResolverConfig, Toggle};
pub use error::{
    BridgeError, ConversionCause, ConversionError, Direction, EvalError, PathSegment,
};
pub use value::{Namespace, ScriptInt, ScriptStruct, ScriptValue};
