//! Update queue and coalescer.
//!
//! Two queues connect the execution contexts:
//!
//! ```text
//!  CA listener ──┐                                   ┌──► CA publish queue ──► CA listener
//!                ├──► update queue ──► execution loop┤
//! PVA listener ──┘   (ChangeEvent)                   └──► PVA publish queue ─► PVA listener
//!                                                         (Publication)
//! ```
//!
//! Both are [`coalesce`] channels keyed by variable name: while the
//! consumer is busy, further changes to the same variable replace the
//! pending one. The loop therefore never falls behind by more than one
//! evaluation, and a slow listener only ever publishes the newest value.

pub mod coalesce;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lume_types::{Protocol, PvValue};
use serde::{Deserialize, Serialize};

pub use coalesce::Closed;

/// An accepted external change to one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub variable_name: String,
    pub new_value: PvValue,
    pub timestamp: DateTime<Utc>,
    /// Assigned by the update queue; strictly increasing.
    pub seq: u64,
    /// Listener that accepted the change.
    pub origin: Protocol,
}

/// A value the execution loop hands to a listener for publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub value: PvValue,
    /// For inputs: the sequence number of the change that produced the
    /// value. Listeners skip an echo older than their last accepted write.
    pub seq: Option<u64>,
}

pub type UpdateSender = coalesce::CoalescingSender<String, ChangeEvent>;
pub type UpdateReceiver = coalesce::CoalescingReceiver<String, ChangeEvent>;
pub type PublishSender = coalesce::CoalescingSender<String, Publication>;
pub type PublishReceiver = coalesce::CoalescingReceiver<String, Publication>;

/// Creates the update queue feeding the execution loop.
#[must_use]
pub fn update_queue() -> (UpdateSender, UpdateReceiver) {
    coalesce::channel()
}

/// Creates a publish queue feeding one listener.
#[must_use]
pub fn publish_queue() -> (PublishSender, PublishReceiver) {
    coalesce::channel()
}

/// Enqueues a change, stamping it with the queue's sequence number.
///
/// # Errors
///
/// Returns [`Closed`] when the execution loop has gone away.
pub fn push_change(
    queue: &UpdateSender,
    variable_name: &str,
    new_value: PvValue,
    origin: Protocol,
) -> Result<u64, Closed> {
    queue.send_with(variable_name.to_string(), |seq| ChangeEvent {
        variable_name: variable_name.to_string(),
        new_value,
        timestamp: Utc::now(),
        seq,
        origin,
    })
}

/// Enqueues several changes as one unit: the loop merges all of them
/// into the same evaluation. Every event carries the same sequence number.
///
/// # Errors
///
/// Returns [`Closed`] when the execution loop has gone away.
pub fn push_changes(
    queue: &UpdateSender,
    changes: Vec<(String, PvValue)>,
    origin: Protocol,
) -> Result<u64, Closed> {
    let timestamp = Utc::now();
    queue.send_batch_with(|seq| {
        changes.into_iter().map(move |(variable_name, new_value)| {
            let event = ChangeEvent {
                variable_name: variable_name.clone(),
                new_value,
                timestamp,
                seq,
                origin,
            };
            (variable_name, event)
        })
    })
}

/// Where a listener delivers the changes it accepted.
///
/// In-process listeners push straight into the update queue. A listener
/// running in its own process forwards them to the supervisor, which
/// pushes them for it.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Enqueues `changes` as one unit and returns the sequence number they
    /// were stamped with.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] when the execution loop has gone away.
    async fn push(&self, changes: Vec<(String, PvValue)>, origin: Protocol) -> Result<u64, Closed>;
}

#[async_trait]
impl ChangeSink for UpdateSender {
    async fn push(&self, changes: Vec<(String, PvValue)>, origin: Protocol) -> Result<u64, Closed> {
        push_changes(self, changes, origin)
    }
}
