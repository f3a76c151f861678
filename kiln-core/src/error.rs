//! Error taxonomy for the kernel.
//!
//! Every fatal condition the kernel detects itself is one of these variants.
//! Public operations return `anyhow::Result`, so callers recover the class with
//! `err.downcast_ref::<KilnError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KilnError {
    /// Duplicate unit id at registration or on `describe()` rename, or a
    /// command name registered twice.
    #[error("{0}")]
    Conflict(String),

    /// A hook without a valid key/fn, or a malformed expansion return.
    #[error("{0}")]
    Shape(String),

    /// A lifecycle-restricted call made outside its permitted stage.
    #[error("{0}")]
    StageViolation(String),

    /// Schema failure or unknown top-level configuration keys.
    #[error("{0}")]
    ConfigValidation(String),

    #[error("{0}")]
    UnknownCommand(String),

    /// A preset/plugin reference that does not resolve to an existing path.
    #[error("{0}")]
    UnresolvedReference(String),

    /// `applyPlugins` called with an unrecognized dispatch mode.
    #[error("{0}")]
    DispatchType(String),
}

impl KilnError {
    /// Returns the class name, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            KilnError::Conflict(_) => "ConflictError",
            KilnError::Shape(_) => "ShapeError",
            KilnError::StageViolation(_) => "StageViolationError",
            KilnError::ConfigValidation(_) => "ConfigValidationError",
            KilnError::UnknownCommand(_) => "UnknownCommandError",
            KilnError::UnresolvedReference(_) => "UnresolvedReferenceError",
            KilnError::DispatchType(_) => "DispatchTypeError",
        }
    }
}

/// Returns the kernel error carried by `err`, if any.
pub fn kiln_error(err: &anyhow::Error) -> Option<&KilnError> {
    err.downcast_ref::<KilnError>()
}
