use std::fmt;

use sb_host::HostError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToHost,
    ToScript,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToHost => f.write_str("to host"),
            Self::ToScript => f.write_str("to script"),
        }
    }
}

/// One step of the breadcrumb path leading to a failed sub-value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Index(usize),
    Field(String),
    /// The key of the n-th mapping entry.
    MapKey(usize),
    /// The value stored under the key with this representation.
    MapValue(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "[{}]", index),
            Self::Field(name) => write!(f, ".{}", name),
            Self::MapKey(index) => write!(f, ".key({})", index),
            Self::MapValue(key) => write!(f, "[{}]", key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionCause {
    #[error("unsupported kind '{type_name}'")]
    Unsupported { type_name: String },
    #[error("{0}")]
    Host(HostError),
    #[error("cannot construct attribute bag: {0}")]
    StructConstruction(HostError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    pub direction: Direction,
    pub path: Vec<PathSegment>,
    pub cause: ConversionCause,
}

impl ConversionError {
    pub fn unsupported(direction: Direction, type_name: impl Into<String>) -> Self {
        Self::new(
            direction,
            ConversionCause::Unsupported {
                type_name: type_name.into(),
            },
        )
    }

    pub fn host(direction: Direction, error: HostError) -> Self {
        Self::new(direction, ConversionCause::Host(error))
    }

    pub fn struct_construction(error: HostError) -> Self {
        Self::new(Direction::ToHost, ConversionCause::StructConstruction(error))
    }

    fn new(direction: Direction, cause: ConversionCause) -> Self {
        Self {
            direction,
            path: Vec::new(),
            cause,
        }
    }

    /// Adds the enclosing container's context in front of the current path.
    pub fn within(mut self, segment: PathSegment) -> Self {
        self.path.insert(0, segment);
        self
    }

    pub fn path_string(&self) -> String {
        let mut out = String::from("value");
        for segment in &self.path {
            out.push_str(&segment.to_string());
        }
        out
    }

    pub fn host_error(&self) -> Option<&HostError> {
        match &self.cause {
            ConversionCause::Host(error) | ConversionCause::StructConstruction(error) => {
                Some(error)
            }
            ConversionCause::Unsupported { .. } => None,
        }
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot convert {} {}: {}",
            self.path_string(),
            self.direction,
            self.cause
        )
    }
}

impl std::error::Error for ConversionError {}

/// Failure raised while a script ran. The location is where the failing
/// operation sits, inside the innermost script function if there is one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{filename} in {function_name}:{line}:{column}: {message}")]
pub struct EvalError {
    pub message: String,
    pub error_type: String,
    pub filename: String,
    pub line: usize,
    pub column: usize,
    /// `<toplevel>` outside any function.
    pub function_name: String,
    /// One frame per line, outermost call first.
    pub backtrace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Conversion(#[from] ConversionError),
    #[error("{message}")]
    TypeContract { message: String },
    #[error("{0}")]
    HostPropagated(#[from] HostError),
    #[error("instance handle {handle} is not live")]
    StateAccess { handle: String },
    #[error("{filename}:{line}:{column}: {message}")]
    Syntax {
        filename: String,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("{message}")]
    Resolve { message: String },
    #[error("{0}")]
    Eval(#[from] Box<EvalError>),
}

impl BridgeError {
    pub fn type_contract(message: impl Into<String>) -> Self {
        Self::TypeContract {
            message: message.into(),
        }
    }

    pub fn resolve(message: impl Into<String>) -> Self {
        Self::Resolve {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Conversion(_) => "BRIDGE_CONVERSION",
            Self::TypeContract { .. } => "BRIDGE_TYPE_CONTRACT",
            Self::HostPropagated(_) => "BRIDGE_HOST_ERROR",
            Self::StateAccess { .. } => "BRIDGE_STATE_ACCESS",
            Self::Syntax { .. } => "BRIDGE_SYNTAX",
            Self::Resolve { .. } => "BRIDGE_RESOLVE",
            Self::Eval(_) => "BRIDGE_EVAL",
        }
    }

    /// The host exception behind this error, whether propagated directly or
    /// raised while converting a value.
    pub fn host_error(&self) -> Option<&HostError> {
        match self {
            Self::HostPropagated(error) => Some(error),
            Self::Conversion(error) => error.host_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn breadcrumbs_render_outermost_first() {
        let error = ConversionError::unsupported(Direction::ToHost, "function")
            .within(PathSegment::Field("callback".to_string()))
            .within(PathSegment::MapValue("\"config\"".to_string()))
            .within(PathSegment::Index(2));
        assert_eq!(error.path_string(), "value[2][\"config\"].callback");
        assert_eq!(
            error.to_string(),
            "cannot convert value[2][\"config\"].callback to host: unsupported kind 'function'"
        );
    }

    #[test]
    fn host_errors_are_found_through_conversion_causes() {
        let raised = HostError::type_error("unhashable type: 'list'");
        let bridged: BridgeError = ConversionError::host(Direction::ToHost, raised.clone())
            .within(PathSegment::MapKey(0))
            .into();
        assert_eq!(bridged.code(), "BRIDGE_CONVERSION");
        assert_eq!(bridged.host_error(), Some(&raised));

        let unsupported: BridgeError =
            ConversionError::unsupported(Direction::ToScript, "function").into();
        assert_eq!(unsupported.host_error(), None);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            BridgeError::from(HostError::key_error("'x'")).code(),
            "BRIDGE_HOST_ERROR"
        );
        assert_eq!(BridgeError::type_contract("x").code(), "BRIDGE_TYPE_CONTRACT");
        assert_eq!(
            BridgeError::Syntax {
                filename: "main.star".to_string(),
                line: 3,
                column: 7,
                message: "unexpected token".to_string(),
            }
            .to_string(),
            "main.star:3:7: unexpected token"
        );
    }

    #[test]
    fn eval_errors_lead_with_their_location() {
        let error = BridgeError::from(Box::new(EvalError {
            message: "Function not found: - (string, i64)".to_string(),
            error_type: "FunctionNotFound".to_string(),
            filename: "fake.star".to_string(),
            line: 2,
            column: 18,
            function_name: "wrong".to_string(),
            backtrace: "<expr>:1:1: in <toplevel>\nfake.star:2:18: in wrong".to_string(),
        }));
        assert_eq!(error.code(), "BRIDGE_EVAL");
        assert!(error
            .to_string()
            .starts_with("fake.star in wrong:2:18: Function not found"));
    }
}
