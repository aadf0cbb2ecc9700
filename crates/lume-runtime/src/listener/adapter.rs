//! Per-protocol bridge between the registry and a transport.

use super::mapping::{mapping_for, ProtocolMapping};
use crate::queue::{ChangeSink, Publication};
use crate::registry::{
    RegistrySnapshot, StructureBinding, SummaryBinding, ValidationError, VariableRegistry,
};
use crate::transport::{Access, PvTransport, TransportError, TransportRequest, WireValue};
use lume_types::{Protocol, PvValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// How this listener treats one variable.
#[derive(Debug, Clone)]
enum PointRole {
    /// Bound here and published on every change.
    Served { pvname: String },
    /// Owned elsewhere: subscribed to, never published.
    Monitored,
}

/// Where an inbound write on a point goes.
#[derive(Debug, Clone)]
enum WriteTarget {
    Variable(String),
    Structure(usize),
}

/// Result of handling one inbound write.
enum WriteOutcome {
    Accepted(BTreeSet<String>),
    Rejected(ValidationError),
    /// The execution loop is gone; the writer sees the PV as unavailable.
    Unavailable,
}

/// Everything one listener context knows about the model.
///
/// Keeps a mirror of the registry, seeded from the snapshot handed over
/// when the listener attached and updated from accepted writes and
/// publications. Reads are answered by the transport from the last
/// published values, so the mirror only has to stay consistent with
/// what was published.
pub(crate) struct ListenerAdapter {
    protocol: Protocol,
    mapping: &'static dyn ProtocolMapping,
    transport: Box<dyn PvTransport>,
    mirror: VariableRegistry,
    roles: BTreeMap<String, PointRole>,
    writes: HashMap<String, WriteTarget>,
    monitors: HashMap<String, String>,
    structures: Vec<StructureBinding>,
    summary: Option<SummaryBinding>,
    accepted: HashMap<String, u64>,
    updates: Box<dyn ChangeSink>,
}

impl ListenerAdapter {
    pub(crate) fn new(
        protocol: Protocol,
        transport: Box<dyn PvTransport>,
        snapshot: &RegistrySnapshot,
        updates: Box<dyn ChangeSink>,
    ) -> Self {
        let mapping = mapping_for(protocol);
        let mut roles = BTreeMap::new();
        let mut monitors = HashMap::new();
        for var in snapshot.variables() {
            if var.is_served_over(protocol) {
                roles.insert(
                    var.name.clone(),
                    PointRole::Served {
                        pvname: var.address.pvname.clone(),
                    },
                );
            } else if var.is_monitored_over(protocol) {
                monitors.insert(
                    mapping.primary_point(&var.address.pvname, var.kind),
                    var.name.clone(),
                );
                roles.insert(var.name.clone(), PointRole::Monitored);
            }
        }

        Self {
            protocol,
            mapping,
            transport,
            mirror: snapshot.to_registry(),
            roles,
            writes: HashMap::new(),
            monitors,
            structures: snapshot
                .structures()
                .iter()
                .filter(|s| s.protocol == protocol)
                .cloned()
                .collect(),
            summary: snapshot.summary().filter(|s| s.protocol == protocol).cloned(),
            accepted: HashMap::new(),
            updates,
        }
    }

    /// Binds every served point and subscribes to every monitored one.
    pub(crate) async fn bind_all(&mut self) -> Result<(), TransportError> {
        let mut served = 0usize;
        for (name, role) in &self.roles {
            let PointRole::Served { pvname } = role else {
                continue;
            };
            let Ok(var) = self.mirror.get(name) else {
                continue;
            };
            let primary = self.mapping.primary_point(pvname, var.kind);
            for (point, value) in self.mapping.encode(pvname, &var.value) {
                let access = if var.is_input() && point == primary {
                    Access::ReadWrite
                } else {
                    Access::ReadOnly
                };
                self.transport.bind(&point, value, access).await?;
            }
            if var.is_input() {
                self.writes
                    .insert(primary, WriteTarget::Variable(name.clone()));
            }
            served += 1;
        }

        for point in self.monitors.keys() {
            self.transport.monitor(point).await?;
        }

        for (i, s) in self.structures.iter().enumerate() {
            let Some(value) = encode_structure(self.mapping, &self.mirror, s) else {
                continue;
            };
            let writable = s
                .fields
                .iter()
                .any(|f| self.mirror.get(f).is_ok_and(|v| v.is_input()));
            let access = if writable {
                self.writes
                    .insert(s.pvname.clone(), WriteTarget::Structure(i));
                Access::ReadWrite
            } else {
                Access::ReadOnly
            };
            self.transport.bind(&s.pvname, value, access).await?;
        }

        if let Some(summary) = &self.summary {
            for (point, value) in self.mapping.summary_points(&summary.pvname, &summary.record) {
                self.transport.bind(&point, value, Access::ReadOnly).await?;
            }
        }

        info!(
            protocol = %self.protocol,
            served,
            monitored = self.monitors.len(),
            structures = self.structures.len(),
            "listener bound"
        );
        Ok(())
    }

    pub(crate) async fn next_request(&mut self) -> Option<TransportRequest> {
        self.transport.next_request().await
    }

    /// Handles one inbound request.
    ///
    /// # Errors
    ///
    /// Only transport failures are returned; invalid writes are answered
    /// to the writer and invalid monitor updates are logged.
    pub(crate) async fn handle_request(
        &mut self,
        request: TransportRequest,
    ) -> Result<(), TransportError> {
        match request {
            TransportRequest::Write {
                pvname,
                value,
                reply,
            } => match self.accept_write(&pvname, &value).await {
                WriteOutcome::Accepted(dirty) => {
                    self.publish_dirty(&dirty).await?;
                    let _ = reply.send(Ok(()));
                }
                WriteOutcome::Rejected(err) => {
                    debug!(protocol = %self.protocol, pvname, error = %err, "write rejected");
                    let _ = reply.send(Err(err));
                }
                WriteOutcome::Unavailable => {
                    debug!(protocol = %self.protocol, pvname, "write dropped: loop is gone");
                    drop(reply);
                }
            },
            TransportRequest::Monitor { pvname, value } => {
                if let Some(dirty) = self.accept_monitor(&pvname, &value).await {
                    self.publish_dirty(&dirty).await?;
                }
            }
        }
        Ok(())
    }

    async fn accept_write(&mut self, point: &str, wire: &WireValue) -> WriteOutcome {
        let Some(target) = self.writes.get(point).cloned() else {
            return WriteOutcome::Rejected(ValidationError::ReadOnly {
                name: point.to_string(),
            });
        };
        let changes = match target {
            WriteTarget::Variable(name) => self
                .decode_input(&name, wire)
                .map(|value| vec![(name, value)]),
            WriteTarget::Structure(i) => self.decode_structure(i, wire),
        };
        match changes {
            Ok(changes) => self.commit(changes).await,
            Err(err) => WriteOutcome::Rejected(err),
        }
    }

    fn decode_input(&self, name: &str, wire: &WireValue) -> Result<PvValue, ValidationError> {
        let var = self.mirror.get(name)?;
        if !var.is_input() {
            return Err(ValidationError::ReadOnly {
                name: name.to_string(),
            });
        }
        let value = self.mapping.decode_write(var, wire)?;
        var.validate(&value)?;
        Ok(value)
    }

    fn decode_structure(
        &self,
        index: usize,
        wire: &WireValue,
    ) -> Result<Vec<(String, PvValue)>, ValidationError> {
        let s = &self.structures[index];
        let fields = wire
            .as_structure()
            .ok_or_else(|| ValidationError::UnsupportedWireValue {
                name: s.name.clone(),
                found: wire.type_name(),
            })?;
        let mut changes = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            if !s.fields.contains(field) {
                return Err(ValidationError::UnknownVariable {
                    name: field.clone(),
                });
            }
            changes.push((field.clone(), self.decode_input(field, value)?));
        }
        Ok(changes)
    }

    /// Enqueues the changes of one write as a single unit, then mirrors
    /// them.
    async fn commit(&mut self, changes: Vec<(String, PvValue)>) -> WriteOutcome {
        let Ok(seq) = self.updates.push(changes.clone(), self.protocol).await else {
            return WriteOutcome::Unavailable;
        };
        let mut dirty = BTreeSet::new();
        for (name, value) in changes {
            self.accepted.insert(name.clone(), seq);
            match self.mirror.set(&name, value) {
                Ok(changed) => dirty.extend(changed),
                Err(err) => return WriteOutcome::Rejected(err),
            }
        }
        WriteOutcome::Accepted(dirty)
    }

    async fn accept_monitor(&mut self, point: &str, wire: &WireValue) -> Option<BTreeSet<String>> {
        let name = self.monitors.get(point)?.clone();
        let value = self.mirror.get(&name).and_then(|var| {
            let value = self.mapping.decode_write(var, wire)?;
            var.validate(&value)?;
            Ok(value)
        });
        let value = match value {
            Ok(v) => v,
            Err(err) => {
                warn!(protocol = %self.protocol, pvname = point, error = %err, "ignoring monitor update");
                return None;
            }
        };

        let pushed = self
            .updates
            .push(vec![(name.clone(), value.clone())], self.protocol)
            .await;
        let Ok(seq) = pushed else {
            return None;
        };
        self.accepted.insert(name.clone(), seq);
        self.mirror
            .set(&name, value)
            .ok()
            .map(|changed| changed.into_iter().collect())
    }

    /// Applies a batch handed over by the execution loop and publishes
    /// every affected point in one group.
    pub(crate) async fn apply_publication(
        &mut self,
        batch: BTreeMap<String, Publication>,
    ) -> Result<(), TransportError> {
        let mut dirty = BTreeSet::new();
        for (name, publication) in batch {
            if let (Some(seq), Some(accepted)) = (publication.seq, self.accepted.get(&name)) {
                if seq <= *accepted {
                    debug!(protocol = %self.protocol, variable = %name, seq, "skipping stale echo");
                    continue;
                }
            }
            match self.mirror.set(&name, publication.value) {
                Ok(changed) => dirty.extend(changed),
                Err(err) => {
                    warn!(protocol = %self.protocol, variable = %name, error = %err, "dropping publication");
                }
            }
        }
        self.publish_dirty(&dirty).await
    }

    async fn publish_dirty(&mut self, dirty: &BTreeSet<String>) -> Result<(), TransportError> {
        let group = self.publication_group(dirty);
        if group.is_empty() {
            return Ok(());
        }
        debug!(protocol = %self.protocol, points = group.len(), "publishing");
        self.transport.publish(group).await
    }

    /// Points to publish for a set of changed variables.
    ///
    /// A changed bound scalar marks its parent changed too (see
    /// [`VariableRegistry::set`]), so a payload and its axis bounds always
    /// go out together.
    fn publication_group(&self, dirty: &BTreeSet<String>) -> Vec<(String, WireValue)> {
        let mut group = BTreeMap::new();
        for name in dirty {
            let (Some(PointRole::Served { pvname }), Ok(var)) =
                (self.roles.get(name), self.mirror.get(name))
            else {
                continue;
            };
            group.extend(self.mapping.encode(pvname, &var.value));
        }
        for s in &self.structures {
            if s.fields.iter().any(|f| dirty.contains(f)) {
                if let Some(value) = encode_structure(self.mapping, &self.mirror, s) {
                    group.insert(s.pvname.clone(), value);
                }
            }
        }
        group.into_iter().collect()
    }

    pub(crate) async fn close(&mut self) {
        self.transport.close().await;
    }
}

fn encode_structure(
    mapping: &dyn ProtocolMapping,
    mirror: &VariableRegistry,
    s: &StructureBinding,
) -> Option<WireValue> {
    let fields: Vec<(&str, &PvValue)> = s
        .fields
        .iter()
        .filter_map(|f| mirror.get(f).ok().map(|v| (f.as_str(), &v.value)))
        .collect();
    mapping.encode_structure(&fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PvBinding, ServerConfig, VariableDefinition};
    use crate::queue::{publish_queue, update_queue, UpdateReceiver};
    use crate::transport::local::Endpoint;
    use crate::client::ClientError;
    use crate::transport::{LocalHub, NdArray, ProtocolClient};
    use lume_types::{ArrayData, Axis, AxisBounds, VariableKind};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn config() -> ServerConfig {
        ServerConfig::new()
            .with_prefix("t")
            .with_variable("input1", VariableDefinition::scalar_input(1.0, 0.0, 256.0))
            .with_variable("output1", VariableDefinition::image_output(2, 2))
            .with_variable(
                "x_max",
                VariableDefinition::scalar_output(4.0).with_parent("output1", Axis::XMax),
            )
            .with_variable("ext", VariableDefinition::scalar_input(0.0, 0.0, 10.0))
            .with_binding("input1", PvBinding::ca())
            .with_binding("output1", PvBinding::ca())
            .with_binding("x_max", PvBinding::ca())
            .with_binding("ext", PvBinding::ca().with_pvname("other:ext").monitor_only())
    }

    async fn adapter(hub: &LocalHub) -> (ListenerAdapter, UpdateReceiver) {
        let config = config();
        let registry = VariableRegistry::build(&config.variables, &config.epics).unwrap();
        let (tx, rx) = update_queue();
        let transport = hub.open_transport(Endpoint::new(Protocol::ChannelAccess, 5064));
        let mut adapter = ListenerAdapter::new(
            Protocol::ChannelAccess,
            Box::new(transport),
            &registry.snapshot(),
            Box::new(tx),
        );
        adapter.bind_all().await.unwrap();
        (adapter, rx)
    }

    fn client(hub: &LocalHub) -> Arc<dyn ProtocolClient> {
        Arc::new(hub.open_client(Endpoint::new(Protocol::ChannelAccess, 5064)))
    }

    #[tokio::test]
    async fn binds_served_points_only() {
        let hub = LocalHub::new();
        let (_adapter, _rx) = adapter(&hub).await;
        let c = client(&hub);
        assert_eq!(c.get("t:input1").await.unwrap(), WireValue::Double(1.0));
        assert_eq!(
            c.get("t:output1:MaxX_RBV").await.unwrap(),
            WireValue::Double(4.0)
        );
        assert!(matches!(
            c.get("other:ext").await,
            Err(ClientError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn accepted_write_is_enqueued_and_answered() {
        let hub = LocalHub::new();
        let (mut adapter, mut rx) = adapter(&hub).await;
        let (reply, answer) = oneshot::channel();
        adapter
            .handle_request(TransportRequest::Write {
                pvname: "t:input1".into(),
                value: WireValue::Double(10.0),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(answer.await.unwrap(), Ok(()));

        let pending = rx.try_recv().unwrap();
        assert_eq!(pending["input1"].new_value, PvValue::Scalar(10.0));
        assert_eq!(pending["input1"].origin, Protocol::ChannelAccess);
    }

    #[tokio::test]
    async fn out_of_range_write_is_rejected_and_not_enqueued() {
        let hub = LocalHub::new();
        let (mut adapter, mut rx) = adapter(&hub).await;
        let (reply, answer) = oneshot::channel();
        adapter
            .handle_request(TransportRequest::Write {
                pvname: "t:input1".into(),
                value: WireValue::Double(300.0),
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(
            answer.await.unwrap(),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn overflowing_ndarray_write_is_rejected() {
        let config = ServerConfig::new()
            .with_prefix("p")
            .with_variable(
                "img",
                VariableDefinition::array_input(VariableKind::Image, ArrayData::zeros(vec![2, 2])),
            )
            .with_binding("img", PvBinding::pva());
        let registry = VariableRegistry::build(&config.variables, &config.epics).unwrap();
        let hub = LocalHub::new();
        let (tx, mut rx) = update_queue();
        let mut adapter = ListenerAdapter::new(
            Protocol::PvAccess,
            Box::new(hub.open_transport(Endpoint::new(Protocol::PvAccess, 5075))),
            &registry.snapshot(),
            Box::new(tx),
        );
        adapter.bind_all().await.unwrap();

        let (reply, answer) = oneshot::channel();
        adapter
            .handle_request(TransportRequest::Write {
                pvname: "p:img".into(),
                value: WireValue::NdArray(NdArray {
                    shape: vec![usize::MAX, 2],
                    data: Vec::new(),
                    attributes: BTreeMap::new(),
                }),
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(
            answer.await.unwrap(),
            Err(ValidationError::ShapeMismatch { .. })
        ));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn structure_write_is_enqueued_as_one_unit() {
        let config = ServerConfig::new()
            .with_prefix("p")
            .with_variable("x", VariableDefinition::scalar_input(0.0, 0.0, 10.0))
            .with_variable("y", VariableDefinition::scalar_input(0.0, 0.0, 10.0))
            .with_binding("x", PvBinding::pva())
            .with_binding("y", PvBinding::pva())
            .with_binding("xy", PvBinding::pva().with_fields(["x", "y"]));
        let registry = VariableRegistry::build(&config.variables, &config.epics).unwrap();
        let hub = LocalHub::new();
        let (tx, mut rx) = update_queue();
        let mut adapter = ListenerAdapter::new(
            Protocol::PvAccess,
            Box::new(hub.open_transport(Endpoint::new(Protocol::PvAccess, 5075))),
            &registry.snapshot(),
            Box::new(tx),
        );
        adapter.bind_all().await.unwrap();

        let (reply, answer) = oneshot::channel();
        adapter
            .handle_request(TransportRequest::Write {
                pvname: "p:xy".into(),
                value: WireValue::Structure(BTreeMap::from([
                    ("x".to_string(), WireValue::Double(3.0)),
                    ("y".to_string(), WireValue::Double(4.0)),
                ])),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(answer.await.unwrap(), Ok(()));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch["x"].seq, batch["y"].seq);
        assert_eq!(batch["y"].new_value, PvValue::Scalar(4.0));
        assert_eq!(adapter.accepted["x"], adapter.accepted["y"]);
    }

    #[tokio::test]
    async fn write_after_loop_is_gone_drops_reply() {
        let hub = LocalHub::new();
        let (mut adapter, rx) = adapter(&hub).await;
        drop(rx);
        let (reply, answer) = oneshot::channel();
        adapter
            .handle_request(TransportRequest::Write {
                pvname: "t:input1".into(),
                value: WireValue::Double(5.0),
                reply,
            })
            .await
            .unwrap();
        assert!(answer.await.is_err());
    }

    #[tokio::test]
    async fn publication_updates_payload_and_bounds_together() {
        let hub = LocalHub::new();
        let (mut adapter, _rx) = adapter(&hub).await;
        let image = ArrayData::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])
            .with_bounds(AxisBounds::new(0.0, 9.0, 0.0, 1.0));
        let mut batch = BTreeMap::new();
        batch.insert(
            "output1".to_string(),
            Publication {
                value: PvValue::Image(image),
                seq: None,
            },
        );
        batch.insert(
            "x_max".to_string(),
            Publication {
                value: PvValue::Scalar(9.0),
                seq: None,
            },
        );
        adapter.apply_publication(batch).await.unwrap();

        let c = client(&hub);
        let points = c
            .get_many(&[
                "t:output1:ArrayData_RBV".to_string(),
                "t:output1:MaxX_RBV".to_string(),
                "t:x_max".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(
            points[0],
            WireValue::DoubleArray(vec![1.0, 2.0, 3.0, 4.0])
        );
        assert_eq!(points[1], WireValue::Double(9.0));
        assert_eq!(points[2], WireValue::Double(9.0));
    }

    #[tokio::test]
    async fn stale_echo_is_skipped() {
        let hub = LocalHub::new();
        let (mut adapter, _rx) = adapter(&hub).await;
        let (reply, _answer) = oneshot::channel();
        adapter
            .handle_request(TransportRequest::Write {
                pvname: "t:input1".into(),
                value: WireValue::Double(20.0),
                reply,
            })
            .await
            .unwrap();
        let accepted = adapter.accepted["input1"];

        let mut batch = BTreeMap::new();
        batch.insert(
            "input1".to_string(),
            Publication {
                value: PvValue::Scalar(10.0),
                seq: Some(accepted - 1),
            },
        );
        adapter.apply_publication(batch).await.unwrap();
        assert_eq!(
            client(&hub).get("t:input1").await.unwrap(),
            WireValue::Double(20.0)
        );
    }

    #[tokio::test]
    async fn monitor_update_is_validated_then_enqueued() {
        let hub = LocalHub::new();
        let (mut adapter, mut rx) = adapter(&hub).await;
        adapter
            .handle_request(TransportRequest::Monitor {
                pvname: "other:ext".into(),
                value: WireValue::Double(50.0),
            })
            .await
            .unwrap();
        assert!(rx.try_recv().is_none());

        adapter
            .handle_request(TransportRequest::Monitor {
                pvname: "other:ext".into(),
                value: WireValue::Double(5.0),
            })
            .await
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap()["ext"].new_value,
            PvValue::Scalar(5.0)
        );
    }

    #[tokio::test]
    async fn publish_queue_batches_reach_the_adapter() {
        let hub = LocalHub::new();
        let (mut adapter, _rx) = adapter(&hub).await;
        let (tx, mut publications) = publish_queue();
        tx.send(
            "input1".to_string(),
            Publication {
                value: PvValue::Scalar(42.0),
                seq: None,
            },
        )
        .unwrap();
        let batch = publications.recv().await.unwrap();
        adapter.apply_publication(batch).await.unwrap();
        assert_eq!(
            client(&hub).get("t:input1").await.unwrap(),
            WireValue::Double(42.0)
        );
    }
}
