//! Evaluation errors.

use crate::registry::ValidationError;
use lume_types::ErrorCode;
use thiserror::Error;

/// A model evaluation failed.
///
/// The loop records the error, publishes no output, keeps the previous
/// outputs and returns to idle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    /// The model reported a failure.
    #[error("model error: {message}")]
    Model { message: String },

    /// The model panicked.
    #[error("model panicked: {message}")]
    Panicked { message: String },

    /// The model asked for an input that does not exist.
    #[error("model read missing input '{name}'")]
    MissingInput { name: String },

    /// The model returned a value for something that is not an output.
    #[error("model returned unknown output '{name}'")]
    UnknownOutput { name: String },

    /// The model returned an output that fails validation.
    #[error("model returned an invalid output: {source}")]
    InvalidOutput {
        #[source]
        source: ValidationError,
    },
}

impl EvaluationError {
    /// Creates a model error from any message.
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }
}

impl ErrorCode for EvaluationError {
    fn code(&self) -> &'static str {
        match self {
            Self::Model { .. } => "EVAL_MODEL",
            Self::Panicked { .. } => "EVAL_PANICKED",
            Self::MissingInput { .. } => "EVAL_MISSING_INPUT",
            Self::UnknownOutput { .. } => "EVAL_UNKNOWN_OUTPUT",
            Self::InvalidOutput { .. } => "EVAL_INVALID_OUTPUT",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Model { .. } | Self::Panicked { .. } | Self::InvalidOutput { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lume_types::assert_error_codes;

    fn all_variants() -> Vec<EvaluationError> {
        vec![
            EvaluationError::model("boom"),
            EvaluationError::Panicked {
                message: "boom".into(),
            },
            EvaluationError::MissingInput { name: "a".into() },
            EvaluationError::UnknownOutput { name: "a".into() },
            EvaluationError::InvalidOutput {
                source: ValidationError::NonFinite { name: "a".into() },
            },
        ]
    }

    #[test]
    fn error_codes() {
        assert_error_codes(&all_variants(), "EVAL_");
    }

    #[test]
    fn invalid_output_keeps_source() {
        use std::error::Error as _;
        let err = &all_variants()[4];
        assert!(err.source().is_some());
        assert!(err.is_recoverable());
        assert!(!all_variants()[3].is_recoverable());
    }
}
