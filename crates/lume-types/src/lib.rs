//! lume types - shared vocabulary for the lume workspace.
//!
//! This crate holds the data types every other lume crate agrees on:
//!
//! - [`PvValue`]: protocol-neutral process variable payload
//!   ([`ArrayData`], [`AxisBounds`], [`VariableKind`])
//! - [`Protocol`]: Channel Access / pvAccess selector
//! - [`ErrorCode`]: machine-readable error codes implemented by every
//!   error enum in the workspace
//!
//! It has no async runtime and performs no I/O.

mod error;
mod protocol;
mod value;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use protocol::{Protocol, UnknownProtocol};
pub use value::{element_count, ArrayData, Axis, AxisBounds, PvValue, VariableKind};
