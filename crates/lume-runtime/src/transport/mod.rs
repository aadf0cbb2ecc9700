//! Protocol transport contracts.
//!
//! The engine does not implement protocol framing. It talks to wire
//! libraries through two traits:
//!
//! | Trait | Side | Used by |
//! |-------|------|---------|
//! | [`PvTransport`] | server | one listener context per protocol |
//! | [`ProtocolClient`] | client | [`Controller`](crate::client::Controller) |
//!
//! Both are created from factories ([`TransportFactory`],
//! [`ClientFactory`]) given the protocol and its environment overrides
//! (`EPICS_CA_*` / `EPICS_PVA_*`).
//!
//! # Inbound writes
//!
//! Instead of registering an `on_write` callback, a listener pulls
//! [`TransportRequest`]s from [`PvTransport::next_request`]. A write
//! carries a reply channel; the writer is blocked until the listener has
//! validated the value and answered.
//!
//! [`LocalHub`] is an in-process implementation of both sides.

mod error;
pub mod local;
mod wire;

pub use error::TransportError;
pub use local::LocalHub;
pub use wire::{NdArray, WireValue};

use crate::client::ClientError;
use crate::registry::ValidationError;
use async_trait::async_trait;
use lume_types::Protocol;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Client access to a bound point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Answer to an inbound write.
pub type WriteReply = oneshot::Sender<Result<(), ValidationError>>;

/// Something a transport needs its listener to handle.
#[derive(Debug)]
pub enum TransportRequest {
    /// A client wrote `value` to a writable point.
    Write {
        pvname: String,
        value: WireValue,
        reply: WriteReply,
    },
    /// A monitored, externally owned point changed.
    Monitor { pvname: String, value: WireValue },
}

/// Server side of one protocol.
///
/// Owned by exactly one listener context and used from that context's
/// runtime only.
#[async_trait]
pub trait PvTransport: Send {
    /// Protocol this transport speaks.
    fn protocol(&self) -> Protocol;

    /// Serves `pvname` with an initial value.
    async fn bind(
        &mut self,
        pvname: &str,
        initial: WireValue,
        access: Access,
    ) -> Result<(), TransportError>;

    /// Publishes a group of point values atomically: readers see either
    /// none or all of them.
    async fn publish(&mut self, group: Vec<(String, WireValue)>) -> Result<(), TransportError>;

    /// Subscribes to an externally owned point. Changes arrive as
    /// [`TransportRequest::Monitor`].
    async fn monitor(&mut self, pvname: &str) -> Result<(), TransportError>;

    /// Waits for the next inbound request. `None` once closed.
    async fn next_request(&mut self) -> Option<TransportRequest>;

    /// Unbinds every point and releases the endpoint.
    async fn close(&mut self);
}

/// Creates server transports for listener contexts.
pub trait TransportFactory: Send + Sync {
    /// Connects a transport for `protocol` using its environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the environment is invalid or the
    /// endpoint cannot be opened.
    fn connect(
        &self,
        protocol: Protocol,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn PvTransport>, TransportError>;
}

/// Update delivered to a client monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct PvUpdate {
    pub pvname: String,
    pub value: WireValue,
}

/// Client binding for one protocol.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Reads one point.
    async fn get(&self, pvname: &str) -> Result<WireValue, ClientError>;

    /// Reads several points from one consistent state.
    async fn get_many(&self, pvnames: &[String]) -> Result<Vec<WireValue>, ClientError>;

    /// Writes one point and waits for the server's answer.
    async fn put(&self, pvname: &str, value: WireValue) -> Result<(), ClientError>;

    /// Subscribes to a point. The stream ends when the server goes away.
    async fn monitor(&self, pvname: &str) -> Result<mpsc::UnboundedReceiver<PvUpdate>, ClientError>;

    /// Releases connections held by this client.
    async fn close(&self);
}

/// Creates protocol clients for a [`Controller`](crate::client::Controller).
pub trait ClientFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if no binding can be created.
    fn client(
        &self,
        protocol: Protocol,
        env: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError>;
}
