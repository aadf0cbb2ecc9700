//! The execution loop.

use super::{LoopState, LoopStatus};
use crate::model::{evaluate_guarded, InputSnapshot, Model};
use crate::queue::{ChangeEvent, PublishSender, Publication, UpdateReceiver};
use crate::registry::{RegistrySnapshot, VariableRegistry};
use chrono::Utc;
use lume_types::{ErrorCode, Protocol};
use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Requests the supervisor sends to the loop.
pub(crate) enum LoopCommand {
    /// Starts publishing to a (re)started listener and hands back the
    /// registry it should bind with.
    Attach {
        protocol: Protocol,
        publisher: PublishSender,
        reply: oneshot::Sender<RegistrySnapshot>,
    },
}

/// Sole owner of the model and the authoritative registry.
///
/// Runs evaluations one at a time; changes arriving meanwhile coalesce in
/// the update queue and are folded into the next evaluation.
pub(crate) struct ExecutionLoop {
    registry: VariableRegistry,
    model: Box<dyn Model>,
    updates: UpdateReceiver,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    publishers: BTreeMap<Protocol, PublishSender>,
    status: watch::Sender<LoopStatus>,
    snapshots: watch::Sender<RegistrySnapshot>,
    shutdown: watch::Receiver<bool>,
    coalesce_window: Duration,
}

impl ExecutionLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: VariableRegistry,
        model: Box<dyn Model>,
        updates: UpdateReceiver,
        commands: mpsc::UnboundedReceiver<LoopCommand>,
        status: watch::Sender<LoopStatus>,
        snapshots: watch::Sender<RegistrySnapshot>,
        shutdown: watch::Receiver<bool>,
        coalesce_window: Duration,
    ) -> Self {
        Self {
            registry,
            model,
            updates,
            commands,
            publishers: BTreeMap::new(),
            status,
            snapshots,
            shutdown,
            coalesce_window,
        }
    }

    /// Runs the loop on a dedicated thread with its own runtime.
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("lume-loop".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(self.run()),
                    Err(e) => error!("execution loop runtime could not be built: {e}"),
                }
            })
    }

    pub(crate) async fn run(mut self) {
        info!("execution loop started");
        self.evaluate(BTreeMap::new());

        loop {
            self.set_state(LoopState::Idle);
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }

                Some(command) = self.commands.recv() => self.handle_command(command),

                pending = self.updates.recv() => match pending {
                    Some(pending) => {
                        let pending = self.coalesce(pending).await;
                        self.evaluate(pending);
                    }
                    None => break,
                },
            }
        }

        self.updates.close();
        self.set_state(LoopState::Stopped);
        info!("execution loop stopped");
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Attach {
                protocol,
                publisher,
                reply,
            } => {
                debug!(%protocol, "listener attached");
                self.publishers.insert(protocol, publisher);
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    /// Waits out the coalescing window and folds in whatever arrived.
    async fn coalesce(
        &mut self,
        mut pending: BTreeMap<String, ChangeEvent>,
    ) -> BTreeMap<String, ChangeEvent> {
        if !self.coalesce_window.is_zero() {
            tokio::time::sleep(self.coalesce_window).await;
        }
        if let Some(more) = self.updates.try_recv() {
            for (name, event) in more {
                match pending.get(&name) {
                    Some(existing) if existing.seq > event.seq => {}
                    _ => {
                        pending.insert(name, event);
                    }
                }
            }
        }
        pending
    }

    /// One full cycle: apply changes, evaluate, commit, publish.
    ///
    /// Inputs are published even when the evaluation fails, so every
    /// protocol reflects the accepted write. Outputs are published only
    /// on success.
    fn evaluate(&mut self, pending: BTreeMap<String, ChangeEvent>) {
        let mut changed: BTreeMap<String, Option<u64>> = BTreeMap::new();
        let mut rejected = 0u64;
        for (name, event) in pending {
            match self.registry.set(&name, event.new_value) {
                Ok(names) => {
                    for n in names {
                        changed.entry(n).or_insert(None);
                    }
                    changed.insert(name, Some(event.seq));
                }
                Err(e) => {
                    rejected += 1;
                    warn!(variable = %name, origin = %event.origin, error = %e, "dropping invalid change");
                }
            }
        }

        self.set_state(LoopState::Evaluating);
        let inputs = InputSnapshot::new(self.registry.input_values());
        let started = Instant::now();
        let result = evaluate_guarded(self.model.as_mut(), &inputs)
            .and_then(|outputs| self.registry.apply_outputs(outputs.into_inner()));
        let elapsed = started.elapsed();

        let failed = match result {
            Ok(outputs) => {
                debug!(
                    inputs = inputs.len(),
                    outputs = outputs.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "evaluation complete"
                );
                for n in outputs {
                    changed.entry(n).or_insert(None);
                }
                self.set_state(LoopState::Publishing);
                None
            }
            Err(e) => {
                error!(code = e.code(), "evaluation failed: {e}");
                Some(e)
            }
        };

        self.status.send_modify(|s| {
            s.evaluations += 1;
            s.rejected_changes += rejected;
            s.last_evaluation = Some(Utc::now());
            s.last_duration_ms = Some(elapsed.as_millis() as u64);
            if let Some(e) = failed {
                s.failures += 1;
                s.last_error = Some(e);
            }
        });

        self.publish(changed);
        self.snapshots.send_replace(self.registry.snapshot());
    }

    fn publish(&mut self, changed: BTreeMap<String, Option<u64>>) {
        if changed.is_empty() {
            return;
        }
        let batch: Vec<(String, Publication)> = changed
            .into_iter()
            .filter_map(|(name, seq)| {
                let value = self.registry.get(&name).ok()?.value.clone();
                Some((name, Publication { value, seq }))
            })
            .collect();

        self.publishers
            .retain(|protocol, publisher| match publisher.send_batch(batch.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!(%protocol, "listener detached");
                    false
                }
            });
    }

    fn set_state(&self, state: LoopState) {
        self.status.send_if_modified(|s| {
            if s.state == state {
                false
            } else {
                s.state = state;
                true
            }
        });
    }
}
