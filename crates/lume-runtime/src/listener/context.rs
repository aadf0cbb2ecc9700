//! In-process listener execution context.
//!
//! A listener without a [`ListenerCommand`](super::ListenerCommand) runs on
//! its own OS thread with its own single-threaded runtime. A panic or a
//! transport failure ends that thread only; the supervisor observes it
//! through the join handle. [`run_listener`] is the same loop a listener
//! process runs.

use super::adapter::ListenerAdapter;
use super::error::ListenerFault;
use crate::queue::{ChangeSink, PublishReceiver};
use crate::registry::RegistrySnapshot;
use crate::transport::{TransportError, TransportFactory};
use lume_types::Protocol;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Everything a listener context needs to start.
pub(crate) struct ListenerSpec {
    pub protocol: Protocol,
    pub factory: Arc<dyn TransportFactory>,
    pub env: BTreeMap<String, String>,
    pub snapshot: RegistrySnapshot,
    pub updates: Box<dyn ChangeSink>,
    pub publications: PublishReceiver,
    pub shutdown: watch::Receiver<bool>,
    /// Answered once every point is bound, or with the bind failure.
    pub ready: oneshot::Sender<Result<(), ListenerFault>>,
}

/// Spawns a listener context on a dedicated thread.
pub(crate) fn spawn_listener(
    spec: ListenerSpec,
) -> Result<JoinHandle<Result<(), ListenerFault>>, ListenerFault> {
    let protocol = spec.protocol;
    thread::Builder::new()
        .name(format!("lume-{protocol}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ListenerFault::Runtime {
                    protocol,
                    message: e.to_string(),
                })?;
            runtime.block_on(run_listener(spec))
        })
        .map_err(|e| ListenerFault::Spawn {
            protocol,
            message: e.to_string(),
        })
}

/// Connects, binds and serves until shutdown, a closed publish queue or a
/// transport failure.
pub(crate) async fn run_listener(spec: ListenerSpec) -> Result<(), ListenerFault> {
    let ListenerSpec {
        protocol,
        factory,
        env,
        snapshot,
        updates,
        mut publications,
        mut shutdown,
        ready,
    } = spec;
    let fault = |source: TransportError| ListenerFault::Transport { protocol, source };

    let transport = match factory.connect(protocol, &env) {
        Ok(t) => t,
        Err(e) => {
            let _ = ready.send(Err(fault(e.clone())));
            return Err(fault(e));
        }
    };
    let mut adapter = ListenerAdapter::new(protocol, transport, &snapshot, updates);
    drop(snapshot);

    if let Err(e) = adapter.bind_all().await {
        adapter.close().await;
        let _ = ready.send(Err(fault(e.clone())));
        return Err(fault(e));
    }
    let _ = ready.send(Ok(()));
    info!(%protocol, "listener started");

    let result = if *shutdown.borrow() {
        Ok(())
    } else {
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }

                batch = publications.recv() => match batch {
                    Some(batch) => {
                        if let Err(e) = adapter.apply_publication(batch).await {
                            break Err(e);
                        }
                    }
                    None => {
                        debug!(%protocol, "publish queue closed");
                        break Ok(());
                    }
                },

                request = adapter.next_request() => match request {
                    Some(request) => {
                        if let Err(e) = adapter.handle_request(request).await {
                            break Err(e);
                        }
                    }
                    None => break Err(TransportError::Closed),
                },
            }
        }
    };

    adapter.close().await;
    info!(%protocol, "listener stopped");
    result.map_err(fault)
}
