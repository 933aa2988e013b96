use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostErrorKind {
    TypeError,
    ValueError,
    KeyError,
    SystemError,
    RuntimeError,
}

impl HostErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::KeyError => "KeyError",
            Self::SystemError => "SystemError",
            Self::RuntimeError => "RuntimeError",
        }
    }
}

impl fmt::Display for HostErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An exception raised by the host runtime.
///
/// Host calls report failure through `HostResult`; an `Err` plays the role of
/// the runtime's pending error and must be passed along, not re-raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::ValueError, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::KeyError, message)
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::SystemError, message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::RuntimeError, message)
    }
}

pub type HostResult<T> = Result<T, HostError>;
