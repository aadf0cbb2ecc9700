//! Server errors.

use crate::config::ConfigurationError;
use lume_types::ErrorCode;
use thiserror::Error;

/// Failure to create, start or stop a [`Server`](super::Server).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// `start` was called twice, or after `stop`.
    #[error("server was already started")]
    AlreadyStarted,

    #[error("could not spawn {context}: {message}")]
    Spawn {
        context: &'static str,
        message: String,
    },

    #[error("could not wait for interrupt: {message}")]
    Signal { message: String },
}

impl ErrorCode for ServerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "SERVER_CONFIGURATION",
            Self::AlreadyStarted => "SERVER_ALREADY_STARTED",
            Self::Spawn { .. } => "SERVER_SPAWN",
            Self::Signal { .. } => "SERVER_SIGNAL",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}
