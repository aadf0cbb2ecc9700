//! Validation errors.

use lume_types::{ErrorCode, VariableKind};
use thiserror::Error;

/// A value was refused by a variable's declared constraints.
///
/// The variable is left unchanged and the error is reported to whoever
/// attempted the write.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },

    #[error("{value} is outside the range [{min}, {max}] of '{name}'")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("'{name}' expects a {expected} value, got {found}")]
    KindMismatch {
        name: String,
        expected: VariableKind,
        found: VariableKind,
    },

    #[error("'{name}' expects shape {expected:?}, got {found:?} with {len} elements")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
        len: usize,
    },

    #[error("'{name}' does not accept non-finite values")]
    NonFinite { name: String },

    #[error("'{name}' is read-only")]
    ReadOnly { name: String },

    #[error("'{name}' cannot be written with a {found} value")]
    UnsupportedWireValue { name: String, found: &'static str },
}

impl ErrorCode for ValidationError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownVariable { .. } => "VALIDATION_UNKNOWN_VARIABLE",
            Self::OutOfRange { .. } => "VALIDATION_OUT_OF_RANGE",
            Self::KindMismatch { .. } => "VALIDATION_KIND_MISMATCH",
            Self::ShapeMismatch { .. } => "VALIDATION_SHAPE_MISMATCH",
            Self::NonFinite { .. } => "VALIDATION_NON_FINITE",
            Self::ReadOnly { .. } => "VALIDATION_READ_ONLY",
            Self::UnsupportedWireValue { .. } => "VALIDATION_UNSUPPORTED_WIRE_VALUE",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::UnknownVariable { .. } | Self::ReadOnly { .. })
    }
}
