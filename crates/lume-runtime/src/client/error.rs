//! Client errors.

use crate::config::ConfigurationError;
use crate::registry::ValidationError;
use lume_types::ErrorCode;
use thiserror::Error;

/// Failure of a client get/put/monitor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Nothing serves the PV (never started, stopped, or crashed).
    #[error("pv '{pvname}' is unavailable")]
    Unavailable { pvname: String },

    /// The server did not answer in time.
    #[error("timed out after {timeout_ms}ms waiting for '{pvname}'")]
    Timeout { pvname: String, timeout_ms: u64 },

    /// The server refused the written value.
    #[error("write to '{pvname}' rejected: {source}")]
    Rejected {
        pvname: String,
        #[source]
        source: ValidationError,
    },

    /// The controller has no binding for this variable.
    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },

    /// The served value could not be turned back into a variable value.
    #[error("cannot decode '{pvname}': {message}")]
    Decode { pvname: String, message: String },

    /// The controller's configuration is invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// No client binding is available for the protocol environment.
    #[error("cannot connect: {message}")]
    Connect { message: String },

    /// The controller was closed.
    #[error("controller is closed")]
    Closed,
}

impl ClientError {
    pub(crate) fn unavailable(pvname: impl Into<String>) -> Self {
        Self::Unavailable {
            pvname: pvname.into(),
        }
    }

    pub(crate) fn decode(pvname: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            pvname: pvname.into(),
            message: message.into(),
        }
    }
}

impl ErrorCode for ClientError {
    fn code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "CLIENT_UNAVAILABLE",
            Self::Timeout { .. } => "CLIENT_TIMEOUT",
            Self::Rejected { .. } => "CLIENT_REJECTED",
            Self::UnknownVariable { .. } => "CLIENT_UNKNOWN_VARIABLE",
            Self::Decode { .. } => "CLIENT_DECODE",
            Self::Configuration(_) => "CLIENT_CONFIGURATION",
            Self::Connect { .. } => "CLIENT_CONNECT",
            Self::Closed => "CLIENT_CLOSED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Rejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lume_types::assert_error_codes;

    #[test]
    fn error_codes() {
        let all = vec![
            ClientError::unavailable("a"),
            ClientError::Timeout {
                pvname: "a".into(),
                timeout_ms: 1000,
            },
            ClientError::Rejected {
                pvname: "a".into(),
                source: ValidationError::ReadOnly { name: "a".into() },
            },
            ClientError::UnknownVariable { name: "a".into() },
            ClientError::decode("a", "bad"),
            ClientError::Configuration(ConfigurationError::NoProtocols),
            ClientError::Connect {
                message: "x".into(),
            },
            ClientError::Closed,
        ];
        assert_error_codes(&all, "CLIENT_");
        assert!(all[0].is_recoverable());
        assert!(!all[3].is_recoverable());
    }
}
