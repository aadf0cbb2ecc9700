//! Protocol-agnostic client façade.

use super::ClientError;
use crate::config::{Role, ServerConfig};
use crate::listener::{mapping_for, ProtocolMapping};
use crate::registry::VariableRegistry;
use crate::transport::{ClientFactory, ProtocolClient, WireValue};
use chrono::{DateTime, Utc};
use lume_types::{ArrayData, Protocol, PvValue, VariableKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where a variable lives, as a client sees it.
#[derive(Debug, Clone)]
struct ClientBinding {
    pvname: String,
    protocol: Protocol,
    kind: VariableKind,
    role: Role,
}

#[derive(Debug, Default)]
struct Activity {
    input: Mutex<Option<DateTime<Utc>>>,
    output: Mutex<Option<DateTime<Utc>>>,
}

impl Activity {
    fn touch(&self, role: Role) {
        let slot = match role {
            Role::Input => &self.input,
            Role::Output => &self.output,
        };
        *slot.lock() = Some(Utc::now());
    }
}

/// Gets, puts and monitors variables by name, whichever protocol serves
/// them.
///
/// Resolves addresses from the same [`ServerConfig`] the server uses, so
/// prefixes, explicit pvnames and the Channel Access image point family
/// are handled here rather than by the caller.
///
/// ```ignore
/// let controller = Controller::new(&config, &hub)?;
/// controller.put("input1", 10.0).await?;
/// let image = controller.get_image("output1").await?;
/// ```
pub struct Controller {
    bindings: BTreeMap<String, ClientBinding>,
    clients: BTreeMap<Protocol, Arc<dyn ProtocolClient>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    activity: Arc<Activity>,
    closed: AtomicBool,
}

impl Controller {
    /// Creates one protocol client per protocol in use.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] for an invalid configuration
    /// and [`ClientError::Connect`] if a client cannot be created.
    pub fn new(config: &ServerConfig, factory: &dyn ClientFactory) -> Result<Self, ClientError> {
        let registry = VariableRegistry::build(&config.variables, &config.epics)?;
        let bindings: BTreeMap<String, ClientBinding> = registry
            .variables()
            .map(|v| {
                (
                    v.name.clone(),
                    ClientBinding {
                        pvname: v.address.pvname.clone(),
                        protocol: v.address.protocol,
                        kind: v.kind,
                        role: v.role,
                    },
                )
            })
            .collect();

        let mut clients = BTreeMap::new();
        for b in bindings.values() {
            if !clients.contains_key(&b.protocol) {
                let env = config.epics.env.for_protocol(b.protocol);
                clients.insert(b.protocol, factory.client(b.protocol, env)?);
            }
        }
        debug!(variables = bindings.len(), protocols = clients.len(), "controller created");

        Ok(Self {
            bindings,
            clients,
            monitors: Mutex::new(Vec::new()),
            activity: Arc::new(Activity::default()),
            closed: AtomicBool::new(false),
        })
    }

    fn resolve(
        &self,
        name: &str,
    ) -> Result<(&ClientBinding, &Arc<dyn ProtocolClient>), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let binding = self
            .bindings
            .get(name)
            .ok_or_else(|| ClientError::UnknownVariable {
                name: name.to_string(),
            })?;
        let client = self
            .clients
            .get(&binding.protocol)
            .ok_or(ClientError::Closed)?;
        Ok((binding, client))
    }

    /// Reads the current value of `name`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Unavailable`] if nothing serves it,
    /// [`ClientError::Decode`] if the served points do not form a value.
    pub async fn get(&self, name: &str) -> Result<PvValue, ClientError> {
        let (binding, client) = self.resolve(name)?;
        read(client.as_ref(), mapping_for(binding.protocol), binding).await
    }

    /// Reads a scalar.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`ClientError::Decode`] if `name` is
    /// not a scalar.
    pub async fn get_scalar(&self, name: &str) -> Result<f64, ClientError> {
        let value = self.get(name).await?;
        value
            .as_scalar()
            .ok_or_else(|| ClientError::decode(name, format!("expected scalar, got {}", value.kind())))
    }

    /// Reads an image or array payload with its axis bounds.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`ClientError::Decode`] for a scalar.
    pub async fn get_image(&self, name: &str) -> Result<ArrayData, ClientError> {
        match self.get(name).await? {
            PvValue::Image(a) | PvValue::Array(a) => Ok(a),
            PvValue::Scalar(_) => Err(ClientError::decode(name, "expected image or array")),
        }
    }

    /// Writes `value` to `name` and waits for the server's answer.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] if the server refused the value (out of
    /// range, wrong shape, read-only), [`ClientError::Timeout`] if it did
    /// not answer, [`ClientError::Unavailable`] if nothing serves it.
    pub async fn put(&self, name: &str, value: impl Into<PvValue>) -> Result<(), ClientError> {
        let (binding, client) = self.resolve(name)?;
        let mapping = mapping_for(binding.protocol);
        let point = mapping.primary_point(&binding.pvname, binding.kind);
        client.put(&point, mapping.encode_write(&value.into())).await?;
        self.activity.touch(binding.role);
        Ok(())
    }

    /// Calls `callback` with every new value of `name`, starting with the
    /// current one.
    ///
    /// Runs until [`close`](Self::close) or until the server goes away.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be set up.
    pub async fn monitor<F>(&self, name: &str, mut callback: F) -> Result<(), ClientError>
    where
        F: FnMut(PvValue) + Send + 'static,
    {
        let (binding, client) = self.resolve(name)?;
        let binding = binding.clone();
        let client = Arc::clone(client);
        let mapping = mapping_for(binding.protocol);
        let point = mapping.primary_point(&binding.pvname, binding.kind);
        let single_point = mapping.read_points(&binding.pvname, binding.kind).len() == 1;
        let mut updates = client.monitor(&point).await?;
        let activity = Arc::clone(&self.activity);

        let handle = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let value = if single_point {
                    mapping
                        .decode_read(binding.kind, std::slice::from_ref(&update.value))
                        .map_err(|m| ClientError::decode(&binding.pvname, m))
                } else {
                    // The payload point changed; re-read the whole family
                    // so bounds and dimensions match it.
                    read(client.as_ref(), mapping, &binding).await
                };
                match value {
                    Ok(v) => {
                        activity.touch(binding.role);
                        callback(v);
                    }
                    Err(e) => warn!(pvname = %binding.pvname, error = %e, "monitor update dropped"),
                }
            }
            debug!(pvname = %binding.pvname, "monitor ended");
        });
        self.monitors.lock().push(handle);
        Ok(())
    }

    /// When an input was last written or observed through this controller.
    #[must_use]
    pub fn last_input_update(&self) -> Option<DateTime<Utc>> {
        *self.activity.input.lock()
    }

    /// When an output was last observed through this controller.
    #[must_use]
    pub fn last_output_update(&self) -> Option<DateTime<Utc>> {
        *self.activity.output.lock()
    }

    /// Names of every variable this controller can address.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Ends every monitor and releases every protocol client.
    ///
    /// Idempotent; later calls fail with [`ClientError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.monitors.lock().drain(..) {
            handle.abort();
        }
        for client in self.clients.values() {
            client.close().await;
        }
        debug!("controller closed");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        for handle in self.monitors.get_mut().drain(..) {
            handle.abort();
        }
    }
}

async fn read(
    client: &dyn ProtocolClient,
    mapping: &dyn ProtocolMapping,
    binding: &ClientBinding,
) -> Result<PvValue, ClientError> {
    let points = mapping.read_points(&binding.pvname, binding.kind);
    let values: Vec<WireValue> = match points.as_slice() {
        [point] => vec![client.get(point).await?],
        _ => client.get_many(&points).await?,
    };
    mapping
        .decode_read(binding.kind, &values)
        .map_err(|m| ClientError::decode(&binding.pvname, m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PvBinding, VariableDefinition};
    use crate::registry::ValidationError;
    use crate::transport::local::Endpoint;
    use crate::transport::{Access, LocalHub, PvTransport, TransportRequest};

    fn config() -> ServerConfig {
        ServerConfig::new()
            .with_prefix("c")
            .with_variable("input1", VariableDefinition::scalar_input(1.0, 0.0, 10.0))
            .with_variable("out", VariableDefinition::scalar_output(0.0))
            .with_binding("input1", PvBinding::ca())
            .with_binding("out", PvBinding::pva())
    }

    #[tokio::test]
    async fn unknown_variable() {
        let hub = LocalHub::new();
        let c = Controller::new(&config(), &hub).unwrap();
        assert!(matches!(
            c.get("nope").await,
            Err(ClientError::UnknownVariable { .. })
        ));
    }

    #[tokio::test]
    async fn get_without_server_is_unavailable() {
        let hub = LocalHub::new();
        let c = Controller::new(&config(), &hub).unwrap();
        assert!(matches!(
            c.get("out").await,
            Err(ClientError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn put_is_routed_to_the_bound_protocol() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(Endpoint::new(Protocol::ChannelAccess, 5064));
        server
            .bind("c:input1", WireValue::Double(1.0), Access::ReadWrite)
            .await
            .unwrap();
        let owner = tokio::spawn(async move {
            if let Some(TransportRequest::Write { value, reply, .. }) = server.next_request().await
            {
                let answer = if value.as_f64() == Some(99.0) {
                    Err(ValidationError::OutOfRange {
                        name: "input1".into(),
                        value: 99.0,
                        min: 0.0,
                        max: 10.0,
                    })
                } else {
                    Ok(())
                };
                let _ = reply.send(answer);
            }
            server
        });

        let c = Controller::new(&config(), &hub).unwrap();
        assert!(c.last_input_update().is_none());
        let err = c.put("input1", 99.0).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { .. }));
        assert!(c.last_input_update().is_none());
        let _server = owner.await.unwrap();
    }

    #[tokio::test]
    async fn monitor_delivers_values_and_stamps_activity() {
        let hub = LocalHub::new();
        let mut server = hub.open_transport(Endpoint::new(Protocol::PvAccess, 5075));
        server
            .bind("c:out", WireValue::Double(1.0), Access::ReadOnly)
            .await
            .unwrap();

        let c = Controller::new(&config(), &hub).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        c.monitor("out", move |v| {
            let _ = tx.send(v);
        })
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap(), PvValue::Scalar(1.0));

        server
            .publish(vec![("c:out".into(), WireValue::Double(2.5))])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), PvValue::Scalar(2.5));
        assert!(c.last_output_update().is_some());

        c.close().await;
        assert!(matches!(c.get("out").await, Err(ClientError::Closed)));
    }
}
