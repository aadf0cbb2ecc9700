//! lume runtime - process-variable synchronisation and execution engine.
//!
//! Serves a user model over Channel Access and pvAccess: client writes to
//! input PVs become model evaluations, and model outputs become PV
//! updates on every protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────── CA listener ────────────┐   ┌──────────── PVA listener ───────────┐
//! │ own thread or process, PvTransport  │   │ own thread or process, PvTransport  │
//! └──────┬───────────────────▲──────────┘   └──────┬───────────────────▲──────────┘
//!        │ ChangeEvent       │ Publication         │ ChangeEvent       │ Publication
//!        ▼                   │                     ▼                   │
//! ┌──────────────────────────┴─────────────────────────────────────────┴──────────┐
//! │ update queue (coalescing) ──► execution loop ──► Model::evaluate              │
//! │                               owns VariableRegistry                            │
//! └────────────────────────────────────────────────────────────────────────────────┘
//!                         ▲ supervised by Server (start / stop / restart)
//! ```
//!
//! # Modules
//!
//! ## [`config`] - Configuration
//!
//! - [`ServerConfig`](config::ServerConfig): settings, variable definitions, protocol bindings
//! - [`ConfigLoader`](config::ConfigLoader): defaults → TOML file → environment
//!
//! ## [`registry`] - Variable Registry
//!
//! - [`VariableRegistry`](registry::VariableRegistry): typed variables and current values
//! - [`ValidationError`](registry::ValidationError): why a value was refused
//!
//! ## [`model`] - Model Contract
//!
//! - [`Model`](model::Model): `evaluate(inputs) -> outputs`, implemented for closures
//!
//! ## [`engine`] - Execution Loop
//!
//! - [`LoopStatus`](engine::LoopStatus): evaluation count, last error, state
//!
//! ## [`supervisor`] - Server
//!
//! - [`Server`](supervisor::Server): start, stop, listener restart
//! - [`ServerStatus`](supervisor::ServerStatus): loop and listener state
//!
//! ## [`listener`] - Listener Contexts
//!
//! - [`ListenerCommand`](listener::ListenerCommand): run a protocol's listener as a child process
//! - [`serve_listener_stdio`](listener::serve_listener_stdio): entry point of such a process
//!
//! ## [`transport`] - Protocol Contracts
//!
//! - [`PvTransport`](transport::PvTransport) / [`ProtocolClient`](transport::ProtocolClient)
//! - [`LocalHub`](transport::LocalHub): in-process implementation of both
//!
//! ## [`client`] - Controller
//!
//! - [`Controller`](client::Controller): get / put / monitor by variable name
//!
//! # Example
//!
//! ```no_run
//! use lume_runtime::config::{PvBinding, ServerConfig, VariableDefinition};
//! use lume_runtime::engine::EvaluationError;
//! use lume_runtime::model::{InputSnapshot, OutputValues};
//! use lume_runtime::transport::LocalHub;
//! use lume_runtime::{Controller, Server};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::new()
//!     .with_prefix("demo")
//!     .with_variable("x", VariableDefinition::scalar_input(1.0, 0.0, 10.0))
//!     .with_variable("y", VariableDefinition::scalar_output(0.0))
//!     .with_binding("x", PvBinding::ca())
//!     .with_binding("y", PvBinding::pva());
//!
//! let model = |i: &InputSnapshot| -> Result<OutputValues, EvaluationError> {
//!     Ok(OutputValues::new().with("y", 2.0 * i.scalar("x")?))
//! };
//!
//! let hub = LocalHub::new();
//! let server = Server::new(model, config.clone(), Arc::new(hub.clone()))?;
//! server.start(false).await?;
//!
//! let controller = Controller::new(&config, &hub)?;
//! controller.put("x", 4.0).await?;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod listener;
pub mod model;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientError, Controller};
pub use config::{ConfigError, ConfigLoader, ConfigurationError, ServerConfig};
pub use engine::{EvaluationError, LoopState, LoopStatus};
pub use listener::{ListenerCommand, ListenerFault};
pub use model::{InputSnapshot, Model, OutputValues};
pub use registry::{ValidationError, VariableRegistry};
pub use supervisor::{ListenerState, Server, ServerError, ServerHandle, ServerPhase, ServerStatus};
pub use transport::{LocalHub, TransportError};
