//! Listener faults.

use crate::transport::TransportError;
use lume_types::{ErrorCode, Protocol};
use thiserror::Error;

/// A listener context failed.
///
/// Faults are contained to their protocol: the other listener and the
/// execution loop keep running, and the supervisor may restart the
/// failed context.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ListenerFault {
    #[error("{protocol} transport failed: {source}")]
    Transport {
        protocol: Protocol,
        #[source]
        source: TransportError,
    },

    #[error("{protocol} listener panicked: {message}")]
    Panicked { protocol: Protocol, message: String },

    #[error("{protocol} listener runtime could not be built: {message}")]
    Runtime { protocol: Protocol, message: String },

    #[error("{protocol} listener context could not be spawned: {message}")]
    Spawn { protocol: Protocol, message: String },

    #[error("{protocol} listener lost the execution loop")]
    EngineGone { protocol: Protocol },

    /// The listener process ended without reporting why.
    #[error("{protocol} listener process exited: {status}")]
    Exited { protocol: Protocol, status: String },

    /// The listener process broke the frame protocol.
    #[error("{protocol} listener process link failed: {message}")]
    Link { protocol: Protocol, message: String },
}

impl ListenerFault {
    /// Protocol of the failed listener.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Transport { protocol, .. }
            | Self::Panicked { protocol, .. }
            | Self::Runtime { protocol, .. }
            | Self::Spawn { protocol, .. }
            | Self::EngineGone { protocol }
            | Self::Exited { protocol, .. }
            | Self::Link { protocol, .. } => *protocol,
        }
    }
}

impl ErrorCode for ListenerFault {
    fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "LISTENER_TRANSPORT",
            Self::Panicked { .. } => "LISTENER_PANICKED",
            Self::Runtime { .. } => "LISTENER_RUNTIME",
            Self::Spawn { .. } => "LISTENER_SPAWN",
            Self::EngineGone { .. } => "LISTENER_ENGINE_GONE",
            Self::Exited { .. } => "LISTENER_EXITED",
            Self::Link { .. } => "LISTENER_LINK",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Panicked { .. } | Self::Exited { .. }
        )
    }
}
