//! Transport errors.

use lume_types::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server-side transport failure.
///
/// A transport error inside a listener context ends that context and is
/// reported to the supervisor as a listener fault.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    #[error("pvname '{pvname}' is already served on {endpoint}")]
    AddressInUse { pvname: String, endpoint: String },

    #[error("pvname '{pvname}' is not bound by this transport")]
    NotBound { pvname: String },

    #[error("transport is closed")]
    Closed,

    #[error("invalid value '{value}' for {var}")]
    InvalidEnvironment { var: String, value: String },

    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::AddressInUse { .. } => "TRANSPORT_ADDRESS_IN_USE",
            Self::NotBound { .. } => "TRANSPORT_NOT_BOUND",
            Self::Closed => "TRANSPORT_CLOSED",
            Self::InvalidEnvironment { .. } => "TRANSPORT_INVALID_ENVIRONMENT",
            Self::Unsupported { .. } => "TRANSPORT_UNSUPPORTED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::AddressInUse { .. } | Self::Closed)
    }
}
