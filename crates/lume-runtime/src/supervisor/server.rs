//! The server: wiring, lifecycle and listener supervision.

use super::status::{ListenerState, ServerPhase, ServerStatus, SupervisorState};
use super::ServerError;
use crate::config::{
    ConfigurationError, EpicsConfig, ServerConfig, ServerSettings, VariableDefinition,
};
use crate::engine::executor::{ExecutionLoop, LoopCommand};
use crate::engine::LoopStatus;
use crate::listener::{
    run_listener_process, spawn_listener, ListenerCommand, ListenerFault, ListenerSpec,
    ProcessSpec, StartFrame,
};
use crate::model::{panic_message, Model};
use crate::queue::{publish_queue, update_queue, UpdateSender};
use crate::registry::{RegistrySnapshot, VariableRegistry};
use crate::transport::TransportFactory;
use lume_types::{ErrorCode, Protocol};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything `start` consumes.
struct Pending {
    model: Box<dyn Model>,
    registry: VariableRegistry,
    loop_status: watch::Sender<LoopStatus>,
    snapshots: watch::Sender<RegistrySnapshot>,
}

/// Contexts owned by a running server.
struct Running {
    loop_thread: thread::JoinHandle<()>,
    supervisors: Vec<JoinHandle<()>>,
}

struct Shared {
    settings: ServerSettings,
    variables: Arc<BTreeMap<String, VariableDefinition>>,
    epics: Arc<EpicsConfig>,
    factory: Arc<dyn TransportFactory>,
    /// Protocols whose listener runs as a child process.
    processes: Mutex<BTreeMap<Protocol, ListenerCommand>>,
    pending: Mutex<Option<Pending>>,
    running: Mutex<Option<Running>>,
    shutdown: watch::Sender<bool>,
    state: Arc<watch::Sender<SupervisorState>>,
    loop_status: watch::Receiver<LoopStatus>,
    snapshots: watch::Receiver<RegistrySnapshot>,
}

/// Serves a model over the configured protocols.
///
/// ```text
/// Server::new ──► start(monitor) ──► [running] ──► stop()
///   validate        initial eval       listeners     signal shutdown
///   registry        spawn loop         supervised    join (bounded)
///                   spawn listeners                  unbind
/// ```
///
/// `start` can be called once. [`ServerHandle`]s obtained from
/// [`handle`](Self::handle) can stop the server and read its status from
/// any task or thread.
///
/// Listeners run on their own threads by default. A protocol registered
/// with [`with_listener_process`](Self::with_listener_process) runs in a
/// child process instead, so a protocol library that aborts the process
/// takes down only that listener.
pub struct Server {
    handle: ServerHandle,
}

impl Server {
    /// Validates the configuration and builds the registry.
    ///
    /// Nothing is bound until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Configuration`] if no protocol is enabled or
    /// the variable/binding configuration is invalid.
    pub fn new<M>(
        model: M,
        config: ServerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ServerError>
    where
        M: Model + 'static,
    {
        let ServerConfig {
            settings,
            variables,
            epics,
        } = config;
        if settings.protocols.is_empty() {
            return Err(ConfigurationError::NoProtocols.into());
        }
        let registry = VariableRegistry::build(&variables, &epics)?;
        for var in registry.variables() {
            if !settings.protocols.contains(&var.address.protocol) {
                warn!(
                    variable = %var.name,
                    protocol = %var.address.protocol,
                    "protocol is disabled; variable will not be served"
                );
            }
        }

        let (loop_status_tx, loop_status) = watch::channel(LoopStatus::default());
        let (snapshots_tx, snapshots) = watch::channel(registry.snapshot());
        let (shutdown, _) = watch::channel(false);
        let (state, _) = watch::channel(SupervisorState::default());

        info!(
            variables = registry.len(),
            protocols = ?settings.protocols,
            "server created"
        );
        Ok(Self {
            handle: ServerHandle {
                shared: Arc::new(Shared {
                    settings,
                    variables: Arc::new(variables),
                    epics: Arc::new(epics),
                    factory,
                    processes: Mutex::new(BTreeMap::new()),
                    pending: Mutex::new(Some(Pending {
                        model: Box::new(model),
                        registry,
                        loop_status: loop_status_tx,
                        snapshots: snapshots_tx,
                    })),
                    running: Mutex::new(None),
                    shutdown,
                    state: Arc::new(state),
                    loop_status,
                    snapshots,
                }),
            },
        })
    }

    /// Runs the `protocol` listener as a child process launched with
    /// `command`.
    ///
    /// The program serves the listener link on its stdio (see
    /// [`serve_listener_stdio`](crate::listener::serve_listener_stdio)).
    /// Takes effect at [`start`](Self::start).
    #[must_use]
    pub fn with_listener_process(self, protocol: Protocol, command: ListenerCommand) -> Self {
        self.handle
            .shared
            .processes
            .lock()
            .insert(protocol, command);
        self
    }

    /// Clonable handle for stopping and observing the server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Starts the execution loop and one listener context per enabled
    /// protocol.
    ///
    /// The model is evaluated once with the default inputs before any
    /// point is bound. A listener that fails to bind is logged and handed
    /// to the restart policy; the other listener keeps serving.
    ///
    /// With `monitor` set, waits for Ctrl-C (or a [`ServerHandle::stop`]
    /// from elsewhere) and shuts down before returning. Otherwise returns
    /// once every listener has bound or failed.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] on a second call, and
    /// [`ServerError::Spawn`] if the loop thread cannot be created.
    pub async fn start(&self, monitor: bool) -> Result<(), ServerError> {
        let shared = &self.handle.shared;
        let Pending {
            model,
            registry,
            loop_status,
            snapshots,
        } = shared.pending.lock().take().ok_or(ServerError::AlreadyStarted)?;

        let (updates, update_rx) = update_queue();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let window = Duration::from_millis(shared.settings.coalesce_window_ms);
        let exec = ExecutionLoop::new(
            registry,
            model,
            update_rx,
            command_rx,
            loop_status,
            snapshots,
            shared.shutdown.subscribe(),
            window,
        );
        let loop_thread = exec.spawn().map_err(|e| ServerError::Spawn {
            context: "execution loop",
            message: e.to_string(),
        })?;

        shared.state.send_modify(|s| {
            s.phase = ServerPhase::Running;
            for p in &shared.settings.protocols {
                s.listeners.insert(*p, ListenerState::Starting { restarts: 0 });
            }
        });

        let grace = Duration::from_millis(shared.settings.shutdown_timeout_ms / 2);
        let mut supervisors = Vec::new();
        for &protocol in &shared.settings.protocols {
            let supervisor = ListenerSupervisor {
                protocol,
                factory: Arc::clone(&shared.factory),
                process: shared.processes.lock().get(&protocol).cloned(),
                variables: Arc::clone(&shared.variables),
                epics: Arc::clone(&shared.epics),
                env: shared.epics.env.for_protocol(protocol).clone(),
                grace,
                updates: updates.clone(),
                commands: commands.clone(),
                shutdown: shared.shutdown.subscribe(),
                state: Arc::clone(&shared.state),
                restart: shared.settings.restart_listeners,
                max_restarts: shared.settings.max_listener_restarts,
            };
            let (ready_tx, ready_rx) = oneshot::channel();
            supervisors.push(tokio::spawn(supervisor.run(ready_tx)));
            match ready_rx.await {
                Ok(Ok(())) => info!(%protocol, "listener ready"),
                Ok(Err(fault)) => {
                    error!(%protocol, code = fault.code(), "listener failed to start: {fault}");
                }
                Err(_) => error!(%protocol, "listener supervisor ended before binding"),
            }
        }
        drop(updates);
        drop(commands);

        *shared.running.lock() = Some(Running {
            loop_thread,
            supervisors,
        });
        info!("server started");

        if *shared.shutdown.borrow() {
            // stop() ran while listeners were still binding.
            self.handle.stop().await;
            return Ok(());
        }

        if monitor {
            let shutdown = shared.shutdown.subscribe();
            let waited = tokio::select! {
                interrupted = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    interrupted.map_err(|e| ServerError::Signal { message: e.to_string() })
                }
                () = shutdown_requested(shutdown) => Ok(()),
            };
            self.handle.stop().await;
            waited?;
        }
        Ok(())
    }

    /// See [`ServerHandle::stop`].
    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    /// See [`ServerHandle::status`].
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        self.handle.status()
    }

    /// See [`ServerHandle::snapshot`].
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.handle.snapshot()
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Clonable control handle for a [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Stops every context and releases every bound point.
    ///
    /// Idempotent, and callable from any task. Each context gets up to
    /// `settings.shutdown_timeout_ms` to quiesce. A listener process that
    /// does not is killed; a listener thread or the execution loop (for
    /// example a model still evaluating) is detached and left to finish.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.shutdown.send_replace(true);
        let running = shared.running.lock().take();
        let pending = shared.pending.lock().take();
        if running.is_none() && pending.is_none() {
            if shared.state.borrow().phase == ServerPhase::Stopping {
                self.stopped().await;
            }
            return;
        }

        shared
            .state
            .send_modify(|s| s.phase = ServerPhase::Stopping);
        info!("stopping server");

        if let Some(running) = running {
            let deadline =
                Instant::now() + Duration::from_millis(shared.settings.shutdown_timeout_ms);
            for mut task in running.supervisors {
                if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                    warn!("listener did not stop in time; abandoning it");
                    // Dropping a process context kills its child.
                    task.abort();
                }
            }

            let loop_thread = running.loop_thread;
            let joined = tokio::time::timeout_at(
                deadline,
                tokio::task::spawn_blocking(move || loop_thread.join()),
            )
            .await;
            match joined {
                Ok(Ok(Ok(()))) => debug!("execution loop joined"),
                Ok(Ok(Err(payload))) => {
                    error!("execution loop panicked: {}", panic_message(payload));
                }
                Ok(Err(e)) => error!("execution loop join failed: {e}"),
                Err(_) => warn!("execution loop did not stop in time; detaching"),
            }
        }

        shared.state.send_modify(|s| {
            s.phase = ServerPhase::Stopped;
            for state in s.listeners.values_mut() {
                if !matches!(state, ListenerState::Faulted { .. }) {
                    *state = ListenerState::Stopped;
                }
            }
        });
        info!("server stopped");
    }

    /// Current loop and listener status.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        let state = self.shared.state.borrow().clone();
        ServerStatus {
            phase: state.phase,
            engine: self.shared.loop_status.borrow().clone(),
            listeners: state.listeners,
        }
    }

    /// Registry as of the last completed evaluation.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.shared.snapshots.borrow().clone()
    }

    /// Receiver that changes whenever the loop status does.
    #[must_use]
    pub fn subscribe_loop(&self) -> watch::Receiver<LoopStatus> {
        self.shared.loop_status.clone()
    }

    /// Resolves once the server has fully stopped.
    pub async fn stopped(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| s.phase == ServerPhase::Stopped).await;
    }
}

/// Runs and restarts one listener context.
struct ListenerSupervisor {
    protocol: Protocol,
    factory: Arc<dyn TransportFactory>,
    /// Set when the listener runs as a child process.
    process: Option<ListenerCommand>,
    variables: Arc<BTreeMap<String, VariableDefinition>>,
    epics: Arc<EpicsConfig>,
    env: BTreeMap<String, String>,
    grace: Duration,
    updates: UpdateSender,
    commands: mpsc::UnboundedSender<LoopCommand>,
    shutdown: watch::Receiver<bool>,
    state: Arc<watch::Sender<SupervisorState>>,
    restart: bool,
    max_restarts: u32,
}

impl ListenerSupervisor {
    async fn run(self, ready: oneshot::Sender<Result<(), ListenerFault>>) {
        let protocol = self.protocol;
        let mut ready = Some(ready);
        let mut restarts = 0u32;

        loop {
            self.set_state(ListenerState::Starting { restarts });
            let outcome = self.run_once(&mut ready, restarts).await;
            if *self.shutdown.borrow() {
                self.set_state(ListenerState::Stopped);
                break;
            }
            let fault = match outcome {
                Ok(()) => {
                    debug!(%protocol, "listener ended with the execution loop");
                    self.set_state(ListenerState::Stopped);
                    break;
                }
                Err(fault) => fault,
            };

            error!(%protocol, code = fault.code(), "listener fault: {fault}");
            if self.restart && fault.is_recoverable() && restarts < self.max_restarts {
                restarts += 1;
                warn!(%protocol, "restarting listener ({restarts}/{})", self.max_restarts);
                continue;
            }
            self.set_state(ListenerState::Faulted { fault, restarts });
            break;
        }
    }

    /// One listener lifetime: attach to the loop, spawn, wait for exit.
    async fn run_once(
        &self,
        ready: &mut Option<oneshot::Sender<Result<(), ListenerFault>>>,
        restarts: u32,
    ) -> Result<(), ListenerFault> {
        let result = self.spawn_and_wait(ready, restarts).await;
        if let (Some(tx), Err(fault)) = (ready.take(), &result) {
            let _ = tx.send(Err(fault.clone()));
        }
        result
    }

    async fn spawn_and_wait(
        &self,
        ready: &mut Option<oneshot::Sender<Result<(), ListenerFault>>>,
        restarts: u32,
    ) -> Result<(), ListenerFault> {
        let protocol = self.protocol;
        let gone = || ListenerFault::EngineGone { protocol };

        let (publisher, publications) = publish_queue();
        let (reply, snapshot) = oneshot::channel();
        self.commands
            .send(LoopCommand::Attach {
                protocol,
                publisher,
                reply,
            })
            .map_err(|_| gone())?;
        let snapshot = snapshot.await.map_err(|_| gone())?;

        let (bound_tx, bound_rx) = oneshot::channel();
        let mut exited: Pin<Box<dyn Future<Output = Result<(), ListenerFault>> + Send>> =
            match &self.process {
                Some(command) => Box::pin(run_listener_process(ProcessSpec {
                    command: command.clone(),
                    start: StartFrame {
                        protocol,
                        env: self.env.clone(),
                        variables: (*self.variables).clone(),
                        epics: (*self.epics).clone(),
                        values: snapshot.values(),
                    },
                    updates: self.updates.clone(),
                    publications,
                    shutdown: self.shutdown.clone(),
                    ready: bound_tx,
                    grace: self.grace,
                })),
                None => {
                    let thread = spawn_listener(ListenerSpec {
                        protocol,
                        factory: Arc::clone(&self.factory),
                        env: self.env.clone(),
                        snapshot,
                        updates: Box::new(self.updates.clone()),
                        publications,
                        shutdown: self.shutdown.clone(),
                        ready: bound_tx,
                    })?;
                    Box::pin(async move {
                        match tokio::task::spawn_blocking(move || thread.join()).await {
                            Ok(Ok(result)) => result,
                            Ok(Err(payload)) => Err(ListenerFault::Panicked {
                                protocol,
                                message: panic_message(payload),
                            }),
                            Err(e) => Err(ListenerFault::Panicked {
                                protocol,
                                message: e.to_string(),
                            }),
                        }
                    })
                }
            };

        // A listener process is only driven while `exited` is polled.
        tokio::select! {
            biased;

            bound = bound_rx => {
                if let Ok(bound) = bound {
                    if bound.is_ok() {
                        self.set_state(ListenerState::Running { restarts });
                    }
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(bound);
                    }
                }
                exited.await
            }
            result = &mut exited => result,
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_modify(|s| {
            s.listeners.insert(self.protocol, state);
        });
    }
}
