//! Protocol listeners.
//!
//! One listener context per enabled protocol. Each owns a
//! [`PvTransport`](crate::transport::PvTransport) and bridges it to the
//! execution loop. A context runs either on its own thread and runtime or,
//! when the server was given a [`ListenerCommand`] for its protocol, in a
//! child process linked to the supervisor by [`link`] frames:
//!
//! ```text
//!            ┌───────────── listener context (thread or process) ──────────────┐
//!  client ──►│ write ─► decode ─► validate ─► push_changes ► reply Ok          │──► update queue
//!            │                      └─ invalid ─► reply Err                    │
//!            │                                                                 │
//!  client ◄──│ publish group ◄─ mirror.set ◄─ publish queue                    │◄── execution loop
//!            └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Point mapping
//!
//! | Kind | Channel Access | pvAccess |
//! |------|----------------|----------|
//! | scalar | `{pv}` | `{pv}` (double) |
//! | array | `{pv}:ArrayData_RBV` + dimension points | `{pv}` (NDArray) |
//! | image | `{pv}:ArrayData_RBV` + dimension, size and bound points | `{pv}` (NDArray with bound attributes) |
//! | structure | unsupported | `{pv}` (structure of fields) |
//!
//! Channel Access image points are always published as one group, so a
//! reader never sees a payload with the bounds of another evaluation.

mod adapter;
mod child;
mod context;
mod error;
pub mod link;
pub mod mapping;
mod process;

pub use child::{serve_listener, serve_listener_stdio, ListenerProcessError};
pub(crate) use context::{spawn_listener, ListenerSpec};
pub use error::ListenerFault;
pub(crate) use link::StartFrame;
pub(crate) use process::{run_listener_process, ProcessSpec};
pub use process::ListenerCommand;
pub use mapping::{mapping_for, ProtocolMapping};
