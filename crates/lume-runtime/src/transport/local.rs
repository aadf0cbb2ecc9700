//! In-process PV fabric.
//!
//! [`LocalHub`] keeps every served point in memory, keyed by
//! `(protocol, port)` endpoint and pvname. It implements both
//! [`TransportFactory`] and [`ClientFactory`], so a server and its clients
//! can run in one process without a network:
//!
//! ```text
//!             LocalHub (Arc<Mutex<HubState>>)
//!     ┌──────────────────────────────────────────┐
//!     │ ca:5064   test:input1 → Double(1.0)       │◄── LocalClient::get / put
//!     │           owner = transport A             │
//!     │ pva:5075  test:output1 → NdArray{..}      │◄── LocalClient::monitor
//!     └──────────────────────────────────────────┘
//!          ▲ bind / publish        │ Write / Monitor requests
//!          │                       ▼
//!     LocalTransport (one per listener context)
//! ```
//!
//! A write to a point is forwarded to the owning transport's request
//! channel and the client waits (bounded by the put timeout) for the
//! owner's verdict. Closing or dropping a transport unbinds its points,
//! so later reads and writes fail as unavailable.

use super::{
    Access, ClientFactory, ProtocolClient, PvTransport, PvUpdate, TransportError,
    TransportFactory, TransportRequest, WireValue,
};
use crate::client::ClientError;
use crate::config::{server_port, CA_SERVER_PORT_VAR, PVA_SERVER_PORT_VAR};
use crate::registry::ValidationError;
use async_trait::async_trait;
use lume_types::Protocol;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Default time a client waits for a write to be acknowledged.
pub const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(1);

/// A protocol server address on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }

    /// Endpoint selected by the protocol's `*_SERVER_PORT` override.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidEnvironment`] for a malformed port.
    pub fn from_env(
        protocol: Protocol,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let port = server_port(protocol, env).map_err(|value| {
            let var = match protocol {
                Protocol::ChannelAccess => CA_SERVER_PORT_VAR,
                Protocol::PvAccess => PVA_SERVER_PORT_VAR,
            };
            TransportError::InvalidEnvironment {
                var: var.to_string(),
                value,
            }
        })?;
        Ok(Self::new(protocol, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)
    }
}

struct HostedPv {
    value: WireValue,
    owner: Uuid,
    access: Access,
    requests: mpsc::UnboundedSender<TransportRequest>,
}

enum Subscriber {
    Server(mpsc::UnboundedSender<TransportRequest>),
    Client(mpsc::UnboundedSender<PvUpdate>),
}

impl Subscriber {
    /// Delivers an update; `false` once the subscriber is gone.
    fn deliver(&self, pvname: &str, value: &WireValue) -> bool {
        match self {
            Self::Server(tx) => tx
                .send(TransportRequest::Monitor {
                    pvname: pvname.to_string(),
                    value: value.clone(),
                })
                .is_ok(),
            Self::Client(tx) => tx
                .send(PvUpdate {
                    pvname: pvname.to_string(),
                    value: value.clone(),
                })
                .is_ok(),
        }
    }
}

#[derive(Default)]
struct EndpointState {
    pvs: HashMap<String, HostedPv>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

impl EndpointState {
    fn notify(&mut self, pvname: &str, value: &WireValue) {
        if let Some(subs) = self.subscribers.get_mut(pvname) {
            subs.retain(|s| s.deliver(pvname, value));
        }
    }
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<Endpoint, EndpointState>,
}

/// In-memory PV fabric shared by transports and clients.
#[derive(Clone)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
    put_timeout: Duration,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints = self.state.lock().endpoints.len();
        f.debug_struct("LocalHub")
            .field("endpoints", &endpoints)
            .field("put_timeout", &self.put_timeout)
            .finish()
    }
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            put_timeout: DEFAULT_PUT_TIMEOUT,
        }
    }

    /// Sets how long clients created from this hub wait for a put.
    #[must_use]
    pub fn with_put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }

    /// Opens a server transport on `endpoint`.
    #[must_use]
    pub fn open_transport(&self, endpoint: Endpoint) -> LocalTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        LocalTransport {
            hub: self.clone(),
            endpoint,
            id: Uuid::new_v4(),
            tx,
            rx,
            closed: false,
        }
    }

    /// Opens a client on `endpoint`.
    #[must_use]
    pub fn open_client(&self, endpoint: Endpoint) -> LocalClient {
        LocalClient {
            hub: self.clone(),
            endpoint,
            put_timeout: self.put_timeout,
        }
    }

    /// `true` if `pvname` is currently served on `endpoint`.
    #[must_use]
    pub fn is_served(&self, endpoint: Endpoint, pvname: &str) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&endpoint)
            .is_some_and(|ep| ep.pvs.contains_key(pvname))
    }

    /// Sorted names of every point served on `endpoint`.
    #[must_use]
    pub fn served_pvs(&self, endpoint: Endpoint) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .endpoints
            .get(&endpoint)
            .map(|ep| ep.pvs.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl TransportFactory for LocalHub {
    fn connect(
        &self,
        protocol: Protocol,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn PvTransport>, TransportError> {
        let endpoint = Endpoint::from_env(protocol, env)?;
        Ok(Box::new(self.open_transport(endpoint)))
    }
}

impl ClientFactory for LocalHub {
    fn client(
        &self,
        protocol: Protocol,
        env: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        let endpoint = Endpoint::from_env(protocol, env).map_err(|e| ClientError::Connect {
            message: e.to_string(),
        })?;
        Ok(Arc::new(self.open_client(endpoint)))
    }
}

/// Server transport on a [`LocalHub`] endpoint.
pub struct LocalTransport {
    hub: LocalHub,
    endpoint: Endpoint,
    id: Uuid,
    tx: mpsc::UnboundedSender<TransportRequest>,
    rx: mpsc::UnboundedReceiver<TransportRequest>,
    closed: bool,
}

impl LocalTransport {
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn release(&mut self) {
        {
            let mut state = self.hub.state.lock();
            if let Some(ep) = state.endpoints.get_mut(&self.endpoint) {
                let owned: Vec<String> = ep
                    .pvs
                    .iter()
                    .filter(|(_, pv)| pv.owner == self.id)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in &owned {
                    ep.pvs.remove(name);
                    ep.subscribers.remove(name);
                }
                for subs in ep.subscribers.values_mut() {
                    subs.retain(|s| match s {
                        Subscriber::Server(tx) => !tx.same_channel(&self.tx),
                        Subscriber::Client(_) => true,
                    });
                }
                debug!(endpoint = %self.endpoint, unbound = owned.len(), "transport released");
            }
        }
        // Pending writes lose their reply channel, so writers see the PV
        // as unavailable instead of waiting for the timeout.
        while self.rx.try_recv().is_ok() {}
    }
}

#[async_trait]
impl PvTransport for LocalTransport {
    fn protocol(&self) -> Protocol {
        self.endpoint.protocol
    }

    async fn bind(
        &mut self,
        pvname: &str,
        initial: WireValue,
        access: Access,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut state = self.hub.state.lock();
        let ep = state.endpoints.entry(self.endpoint).or_default();
        if ep.pvs.get(pvname).is_some_and(|pv| pv.owner != self.id) {
            return Err(TransportError::AddressInUse {
                pvname: pvname.to_string(),
                endpoint: self.endpoint.to_string(),
            });
        }
        ep.pvs.insert(
            pvname.to_string(),
            HostedPv {
                value: initial.clone(),
                owner: self.id,
                access,
                requests: self.tx.clone(),
            },
        );
        ep.notify(pvname, &initial);
        Ok(())
    }

    async fn publish(&mut self, group: Vec<(String, WireValue)>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut state = self.hub.state.lock();
        let ep = state.endpoints.entry(self.endpoint).or_default();
        if let Some((pvname, _)) = group
            .iter()
            .find(|(name, _)| !ep.pvs.get(name).is_some_and(|pv| pv.owner == self.id))
        {
            return Err(TransportError::NotBound {
                pvname: pvname.clone(),
            });
        }
        for (pvname, value) in &group {
            if let Some(pv) = ep.pvs.get_mut(pvname) {
                pv.value = value.clone();
            }
        }
        for (pvname, value) in &group {
            ep.notify(pvname, value);
        }
        Ok(())
    }

    async fn monitor(&mut self, pvname: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut state = self.hub.state.lock();
        let ep = state.endpoints.entry(self.endpoint).or_default();
        let sub = Subscriber::Server(self.tx.clone());
        if let Some(pv) = ep.pvs.get(pvname) {
            sub.deliver(pvname, &pv.value);
        }
        ep.subscribers
            .entry(pvname.to_string())
            .or_default()
            .push(sub);
        Ok(())
    }

    async fn next_request(&mut self) -> Option<TransportRequest> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) {
        if !self.closed {
            self.release();
            self.closed = true;
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.release();
        }
    }
}

/// Client on a [`LocalHub`] endpoint.
#[derive(Debug, Clone)]
pub struct LocalClient {
    hub: LocalHub,
    endpoint: Endpoint,
    put_timeout: Duration,
}

#[async_trait]
impl ProtocolClient for LocalClient {
    fn protocol(&self) -> Protocol {
        self.endpoint.protocol
    }

    async fn get(&self, pvname: &str) -> Result<WireValue, ClientError> {
        let state = self.hub.state.lock();
        state
            .endpoints
            .get(&self.endpoint)
            .and_then(|ep| ep.pvs.get(pvname))
            .map(|pv| pv.value.clone())
            .ok_or_else(|| ClientError::unavailable(pvname))
    }

    async fn get_many(&self, pvnames: &[String]) -> Result<Vec<WireValue>, ClientError> {
        let state = self.hub.state.lock();
        let ep = state.endpoints.get(&self.endpoint);
        pvnames
            .iter()
            .map(|name| {
                ep.and_then(|ep| ep.pvs.get(name))
                    .map(|pv| pv.value.clone())
                    .ok_or_else(|| ClientError::unavailable(name.as_str()))
            })
            .collect()
    }

    async fn put(&self, pvname: &str, value: WireValue) -> Result<(), ClientError> {
        let requests = {
            let state = self.hub.state.lock();
            let pv = state
                .endpoints
                .get(&self.endpoint)
                .and_then(|ep| ep.pvs.get(pvname))
                .ok_or_else(|| ClientError::unavailable(pvname))?;
            if pv.access == Access::ReadOnly {
                return Err(ClientError::Rejected {
                    pvname: pvname.to_string(),
                    source: ValidationError::ReadOnly {
                        name: pvname.to_string(),
                    },
                });
            }
            pv.requests.clone()
        };

        let (reply, answer) = oneshot::channel();
        requests
            .send(TransportRequest::Write {
                pvname: pvname.to_string(),
                value,
                reply,
            })
            .map_err(|_| ClientError::unavailable(pvname))?;

        match tokio::time::timeout(self.put_timeout, answer).await {
            Err(_) => Err(ClientError::Timeout {
                pvname: pvname.to_string(),
                timeout_ms: u64::try_from(self.put_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Ok(Err(_)) => Err(ClientError::unavailable(pvname)),
            Ok(Ok(Err(source))) => Err(ClientError::Rejected {
                pvname: pvname.to_string(),
                source,
            }),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }

    async fn monitor(
        &self,
        pvname: &str,
    ) -> Result<mpsc::UnboundedReceiver<PvUpdate>, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.state.lock();
        let ep = state.endpoints.entry(self.endpoint).or_default();
        let sub = Subscriber::Client(tx);
        if let Some(pv) = ep.pvs.get(pvname) {
            sub.deliver(pvname, &pv.value);
        }
        ep.subscribers
            .entry(pvname.to_string())
            .or_default()
            .push(sub);
        Ok(rx)
    }

    async fn close(&self) {
        debug!(endpoint = %self.endpoint, "local client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca() -> Endpoint {
        Endpoint::new(Protocol::ChannelAccess, 5064)
    }

    #[tokio::test]
    async fn bind_then_get() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(ca());
        server
            .bind("a", WireValue::Double(1.0), Access::ReadOnly)
            .await
            .unwrap();

        let client = hub.open_client(ca());
        assert_eq!(client.get("a").await.unwrap(), WireValue::Double(1.0));
        assert!(hub.is_served(ca(), "a"));
        assert!(matches!(
            client.get("b").await,
            Err(ClientError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn second_owner_cannot_bind() {
        let hub = LocalHub::new();
        let mut first = hub.open_transport(ca());
        let mut second = hub.open_transport(ca());
        first
            .bind("a", WireValue::Double(1.0), Access::ReadOnly)
            .await
            .unwrap();
        assert!(matches!(
            second
                .bind("a", WireValue::Double(2.0), Access::ReadOnly)
                .await,
            Err(TransportError::AddressInUse { .. })
        ));
        let other_port = Endpoint::new(Protocol::ChannelAccess, 6064);
        let mut third = hub.open_transport(other_port);
        assert!(third
            .bind("a", WireValue::Double(3.0), Access::ReadOnly)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn put_is_routed_to_owner() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(ca());
        server
            .bind("a", WireValue::Double(1.0), Access::ReadWrite)
            .await
            .unwrap();

        let client = hub.open_client(ca());
        let put = tokio::spawn(async move { client.put("a", WireValue::Double(4.0)).await });

        match server.next_request().await {
            Some(TransportRequest::Write {
                pvname,
                value,
                reply,
            }) => {
                assert_eq!(pvname, "a");
                assert_eq!(value, WireValue::Double(4.0));
                reply.send(Ok(())).unwrap();
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert!(put.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn rejected_put_carries_reason() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(ca());
        server
            .bind("a", WireValue::Double(1.0), Access::ReadWrite)
            .await
            .unwrap();
        let client = hub.open_client(ca());
        let put = tokio::spawn(async move { client.put("a", WireValue::Double(999.0)).await });

        if let Some(TransportRequest::Write { reply, .. }) = server.next_request().await {
            let _ = reply.send(Err(ValidationError::NonFinite { name: "a".into() }));
        }
        assert!(matches!(
            put.await.unwrap(),
            Err(ClientError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn read_only_put_is_rejected_without_owner() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(ca());
        server
            .bind("out", WireValue::Double(1.0), Access::ReadOnly)
            .await
            .unwrap();
        let err = hub
            .open_client(ca())
            .put("out", WireValue::Double(2.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rejected {
                source: ValidationError::ReadOnly { .. },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn put_times_out_when_owner_is_silent() {
        let hub = LocalHub::new().with_put_timeout(Duration::from_millis(50));
        let mut server = hub.open_transport(ca());
        server
            .bind("a", WireValue::Double(1.0), Access::ReadWrite)
            .await
            .unwrap();
        let err = hub
            .open_client(ca())
            .put("a", WireValue::Double(2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { timeout_ms: 50, .. }));
        drop(server);
    }

    #[tokio::test]
    async fn publish_is_atomic_and_checks_ownership() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(ca());
        for name in ["img:ArrayData_RBV", "img:MaxX_RBV"] {
            server
                .bind(name, WireValue::Double(0.0), Access::ReadOnly)
                .await
                .unwrap();
        }
        server
            .publish(vec![
                ("img:ArrayData_RBV".into(), WireValue::DoubleArray(vec![1.0])),
                ("img:MaxX_RBV".into(), WireValue::Double(9.0)),
            ])
            .await
            .unwrap();
        let values = hub
            .open_client(ca())
            .get_many(&["img:ArrayData_RBV".into(), "img:MaxX_RBV".into()])
            .await
            .unwrap();
        assert_eq!(values[1], WireValue::Double(9.0));

        let err = server
            .publish(vec![
                ("img:MaxX_RBV".into(), WireValue::Double(1.0)),
                ("ghost".into(), WireValue::Double(1.0)),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotBound { .. }));
        assert_eq!(
            hub.open_client(ca()).get("img:MaxX_RBV").await.unwrap(),
            WireValue::Double(9.0)
        );
    }

    #[tokio::test]
    async fn monitors_see_updates_and_end_on_close() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(ca());
        server
            .bind("a", WireValue::Double(1.0), Access::ReadOnly)
            .await
            .unwrap();
        let mut updates = hub.open_client(ca()).monitor("a").await.unwrap();
        assert_eq!(updates.recv().await.unwrap().value, WireValue::Double(1.0));

        server
            .publish(vec![("a".into(), WireValue::Double(2.0))])
            .await
            .unwrap();
        assert_eq!(updates.recv().await.unwrap().value, WireValue::Double(2.0));

        server.close().await;
        assert!(updates.recv().await.is_none());
        assert!(!hub.is_served(ca(), "a"));
        assert!(server.next_request().await.is_none());
    }

    #[tokio::test]
    async fn server_monitor_receives_external_changes() {
        let hub = LocalHub::new();
        let mut ioc = hub.open_transport(ca());
        let mut watcher = hub.open_transport(ca());
        watcher.monitor("ext").await.unwrap();
        ioc.bind("ext", WireValue::Double(5.0), Access::ReadOnly)
            .await
            .unwrap();
        match watcher.next_request().await {
            Some(TransportRequest::Monitor { pvname, value }) => {
                assert_eq!(pvname, "ext");
                assert_eq!(value, WireValue::Double(5.0));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_transport_unbinds() {
        let hub = LocalHub::new();
        {
            let mut server = hub.open_transport(ca());
            server
                .bind("a", WireValue::Double(1.0), Access::ReadOnly)
                .await
                .unwrap();
            assert_eq!(hub.served_pvs(ca()), vec!["a".to_string()]);
        }
        assert!(hub.served_pvs(ca()).is_empty());
    }

    #[test]
    fn endpoint_from_env() {
        let mut env = BTreeMap::new();
        assert_eq!(
            Endpoint::from_env(Protocol::PvAccess, &env).unwrap(),
            Endpoint::new(Protocol::PvAccess, 5075)
        );
        env.insert(PVA_SERVER_PORT_VAR.to_string(), "6075".to_string());
        assert_eq!(
            Endpoint::from_env(Protocol::PvAccess, &env).unwrap().port,
            6075
        );
        env.insert(PVA_SERVER_PORT_VAR.to_string(), "x".to_string());
        assert!(matches!(
            Endpoint::from_env(Protocol::PvAccess, &env),
            Err(TransportError::InvalidEnvironment { .. })
        ));
        assert_eq!(
            Endpoint::new(Protocol::ChannelAccess, 5064).to_string(),
            "ca:5064"
        );
    }
}
