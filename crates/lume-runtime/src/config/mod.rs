//! Server configuration.
//!
//! # Architecture
//!
//! A [`ServerConfig`] holds the two mappings the engine consumes plus
//! runtime settings:
//!
//! ```text
//! ServerConfig
//! ├── settings     ServerSettings   protocols, coalescing, shutdown, restarts
//! ├── variables    name → VariableDefinition {kind, role, default, range, ...}
//! └── epics        EpicsConfig
//!     ├── prefix   "{prefix}:{name}" addressing
//!     ├── pvs      name → PvBinding {pvname, protocol, serve, fields}
//!     ├── summary  optional SummaryRecord
//!     └── env      EPICS_CA_* / EPICS_PVA_* overrides
//! ```
//!
//! Configs are either built in code (builder methods on each type) or
//! loaded with [`ConfigLoader`]. The config is immutable once a server
//! has started.

mod error;
mod loader;
mod types;

pub use error::{ConfigError, ConfigurationError};
pub use loader::{parse_protocols, ConfigLoader};
pub use types::{
    server_port, EpicsConfig, ProtocolEnvironment, PvBinding, Role, ServerConfig, ServerSettings,
    SummaryRecord, ValueRange, ValueSpec, VariableDefinition, CA_SERVER_PORT_VAR, DEFAULT_CA_PORT,
    DEFAULT_PVA_PORT, PVA_SERVER_PORT_VAR,
};
