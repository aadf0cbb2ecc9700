//! Client controller.
//!
//! [`Controller`] is for dashboards and scripts talking to a running
//! server. It is not used by the server itself.

mod controller;
mod error;

pub use controller::Controller;
pub use error::ClientError;
