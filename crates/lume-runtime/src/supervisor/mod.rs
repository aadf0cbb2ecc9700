//! Process supervisor.
//!
//! [`Server`] wires the registry, update queue, execution loop and one
//! listener context per enabled protocol, then keeps the listeners alive:
//!
//! | Event | Reaction |
//! |-------|----------|
//! | listener transport error or panic | restart (up to `max_listener_restarts`) with the latest registry |
//! | listener fails for good | [`ListenerState::Faulted`]; the other protocol keeps serving |
//! | model error or panic | logged by the loop; server keeps running |
//! | `stop()` | shutdown signal, bounded join, unbind everything |

mod error;
mod server;
mod status;

pub use error::ServerError;
pub use server::{Server, ServerHandle};
pub use status::{ListenerState, ServerPhase, ServerStatus};
