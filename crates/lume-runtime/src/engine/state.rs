//! Execution loop status.

use super::EvaluationError;
use chrono::{DateTime, Utc};
use std::fmt;

/// Phase of the execution loop.
///
/// ```text
/// Idle ──changes──► Evaluating ──ok──► Publishing ──► Idle
///                        └──────error──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Idle,
    Evaluating,
    Publishing,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Evaluating => "evaluating",
            Self::Publishing => "publishing",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Observable state of the execution loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStatus {
    pub state: LoopState,
    /// Completed evaluations, successful or not. Includes the initial one.
    pub evaluations: u64,
    pub failures: u64,
    /// Changes dropped because they failed validation against the
    /// authoritative registry.
    pub rejected_changes: u64,
    pub last_error: Option<EvaluationError>,
    pub last_evaluation: Option<DateTime<Utc>>,
    /// Duration of the last evaluation in milliseconds.
    pub last_duration_ms: Option<u64>,
}

impl LoopStatus {
    /// Successful evaluations so far.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.evaluations - self.failures
    }
}
