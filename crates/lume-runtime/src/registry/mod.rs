//! Variable registry.
//!
//! Typed descriptors for every model variable plus the current snapshot
//! of model state.
//!
//! # Writers
//!
//! ```text
//! listener (input write) ──validate──► ChangeEvent ──► execution loop ──► set()
//!                                                          │
//!                                          model outputs ──┴──► apply_outputs()
//! ```
//!
//! The authoritative registry lives inside the execution loop, which is
//! its only writer. Listener contexts keep a mirror built from a
//! [`RegistrySnapshot`] and validate against the same [`Variable`]
//! descriptors, so a rejected write never reaches the loop.

mod error;
#[allow(clippy::module_inception)]
mod registry;
mod variable;

pub use error::ValidationError;
pub use registry::{RegistrySnapshot, StructureBinding, SummaryBinding, VariableRegistry};
pub use variable::{ParentBinding, PvAddress, Variable};
