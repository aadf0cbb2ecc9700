//! Execution loop.
//!
//! The loop is the only place the model runs and the only writer of the
//! authoritative [`VariableRegistry`](crate::registry::VariableRegistry).
//!
//! # Cycle
//!
//! ```text
//! loop {
//!     1. Wait for pending changes (or shutdown / attach commands)
//!     2. Wait out the coalescing window, fold in late changes
//!     3. Apply changes to the registry (invalid ones are dropped)
//!     4. Evaluate the model with the full input set
//!     5. Commit outputs all-or-nothing
//!     6. Hand changed values to every attached listener
//! }
//! ```
//!
//! An evaluation error or panic is logged and counted in [`LoopStatus`];
//! previously published outputs stay in place and the loop keeps going.

mod error;
pub(crate) mod executor;
mod state;

pub use error::EvaluationError;
pub use state::{LoopState, LoopStatus};
