//! Server and listener status.

use crate::engine::LoopStatus;
use crate::listener::ListenerFault;
use lume_types::Protocol;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle phase of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerPhase {
    #[default]
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// State of one listener context as seen by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerState {
    Starting { restarts: u32 },
    Running { restarts: u32 },
    /// Failed and not restarted (anymore).
    Faulted { fault: ListenerFault, restarts: u32 },
    Stopped,
}

impl ListenerState {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Number of times this listener was restarted after a fault.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        match self {
            Self::Starting { restarts }
            | Self::Running { restarts }
            | Self::Faulted { restarts, .. } => *restarts,
            Self::Stopped => 0,
        }
    }
}

/// Supervisor-owned part of the status.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SupervisorState {
    pub phase: ServerPhase,
    pub listeners: BTreeMap<Protocol, ListenerState>,
}

/// Point-in-time status of a server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub phase: ServerPhase,
    pub engine: LoopStatus,
    pub listeners: BTreeMap<Protocol, ListenerState>,
}

impl ServerStatus {
    /// Listener state for `protocol`, `None` if it is not enabled.
    #[must_use]
    pub fn listener(&self, protocol: Protocol) -> Option<&ListenerState> {
        self.listeners.get(&protocol)
    }

    /// `true` while running with every enabled listener up.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.phase == ServerPhase::Running && self.listeners.values().all(ListenerState::is_running)
    }
}
