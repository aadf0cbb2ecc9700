//! Configuration types.
//!
//! All types implement [`Default`] (or are plain records) and round-trip
//! through TOML. A complete server configuration looks like:
//!
//! ```toml
//! [settings]
//! protocols = ["ca", "pva"]
//! coalesce_window_ms = 5
//!
//! [variables.input1]
//! kind = "scalar"
//! role = "input"
//! default = 1.0
//! range = [0.0, 256.0]
//!
//! [variables.output1]
//! kind = "image"
//! role = "output"
//! shape = [50, 50]
//!
//! [epics]
//! prefix = "test"
//!
//! [epics.pvs.input1]
//! protocol = "ca"
//!
//! [epics.pvs.output1]
//! protocol = "pva"
//! ```

use chrono::{DateTime, Utc};
use lume_types::{ArrayData, Axis, AxisBounds, Protocol, PvValue, VariableKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment variable naming the Channel Access server port.
pub const CA_SERVER_PORT_VAR: &str = "EPICS_CA_SERVER_PORT";

/// Environment variable naming the pvAccess server port.
pub const PVA_SERVER_PORT_VAR: &str = "EPICS_PVA_SERVER_PORT";

/// Default Channel Access server port.
pub const DEFAULT_CA_PORT: u16 = 5064;

/// Default pvAccess server port.
pub const DEFAULT_PVA_PORT: u16 = 5075;

/// Complete server configuration.
///
/// # Example
///
/// ```
/// use lume_runtime::config::ServerConfig;
///
/// let config = ServerConfig::default();
/// assert_eq!(config.settings.coalesce_window_ms, 5);
/// assert!(config.variables.is_empty());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Runtime settings.
    pub settings: ServerSettings,

    /// Variable definitions keyed by variable name.
    pub variables: BTreeMap<String, VariableDefinition>,

    /// Protocol bindings.
    pub epics: EpicsConfig,
}

impl ServerConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable definition.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, def: VariableDefinition) -> Self {
        self.variables.insert(name.into(), def);
        self
    }

    /// Adds a protocol binding.
    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, binding: PvBinding) -> Self {
        self.epics.pvs.insert(name.into(), binding);
        self
    }

    /// Sets the PV name prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.epics.prefix = Some(prefix.into());
        self
    }

    /// Serializes to TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

/// Runtime settings for the supervisor and execution loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    /// Protocols to serve. Listeners for other protocols are not started.
    pub protocols: Vec<Protocol>,

    /// Time the loop waits after waking on pending input before it
    /// evaluates, so back-to-back writes land in one evaluation.
    pub coalesce_window_ms: u64,

    /// Bound on how long `stop()` waits for each context to quiesce.
    pub shutdown_timeout_ms: u64,

    /// Restart a listener context after it faults.
    pub restart_listeners: bool,

    /// Maximum restarts per listener before it is left faulted.
    pub max_listener_restarts: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            protocols: Protocol::ALL.to_vec(),
            coalesce_window_ms: 5,
            shutdown_timeout_ms: 5_000,
            restart_listeners: true,
            max_listener_restarts: 3,
        }
    }
}

/// Whether a variable is written by clients or by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Input,
    Output,
}

/// Literal default in a variable definition: a number or an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    Number(f64),
    Array(ArrayData),
}

/// Inclusive numeric bounds, written `[min, max]` in config files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    #[must_use]
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl From<[f64; 2]> for ValueRange {
    fn from([min, max]: [f64; 2]) -> Self {
        Self { min, max }
    }
}

impl From<ValueRange> for [f64; 2] {
    fn from(r: ValueRange) -> Self {
        [r.min, r.max]
    }
}

/// Definition of one model variable.
///
/// Array and image variables need either a `default` array or a `shape`
/// (the default is then all zeros). A scalar carrying `parent` + `axis`
/// supplies one axis bound of the named image/array variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub kind: VariableKind,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ValueSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ValueRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<AxisBounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<Axis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
}

impl VariableDefinition {
    fn bare(kind: VariableKind, role: Role) -> Self {
        Self {
            kind,
            role,
            default: None,
            range: None,
            shape: None,
            bounds: None,
            parent: None,
            axis: None,
            units: None,
            precision: None,
        }
    }

    /// Scalar input with a default and an inclusive range.
    #[must_use]
    pub fn scalar_input(default: f64, min: f64, max: f64) -> Self {
        let mut def = Self::bare(VariableKind::Scalar, Role::Input);
        def.default = Some(ValueSpec::Number(default));
        def.range = Some(ValueRange::new(min, max));
        def
    }

    /// Scalar output defaulting to `default`.
    #[must_use]
    pub fn scalar_output(default: f64) -> Self {
        let mut def = Self::bare(VariableKind::Scalar, Role::Output);
        def.default = Some(ValueSpec::Number(default));
        def
    }

    /// Zero-filled image output of the given `[rows, cols]` shape.
    #[must_use]
    pub fn image_output(rows: usize, cols: usize) -> Self {
        let mut def = Self::bare(VariableKind::Image, Role::Output);
        def.shape = Some(vec![rows, cols]);
        def
    }

    /// Zero-filled array output.
    #[must_use]
    pub fn array_output(shape: Vec<usize>) -> Self {
        let mut def = Self::bare(VariableKind::Array, Role::Output);
        def.shape = Some(shape);
        def
    }

    /// Array or image input with an explicit default.
    #[must_use]
    pub fn array_input(kind: VariableKind, default: ArrayData) -> Self {
        let mut def = Self::bare(kind, Role::Input);
        def.default = Some(ValueSpec::Array(default));
        def
    }

    /// Binds this scalar to one axis bound of `parent`.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>, axis: Axis) -> Self {
        self.parent = Some(parent.into());
        self.axis = Some(axis);
        self
    }

    #[must_use]
    pub fn with_bounds(mut self, bounds: AxisBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    #[must_use]
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(ValueRange::new(min, max));
        self
    }

    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Default value described by this definition, before validation.
    ///
    /// Returns `None` when the definition carries neither a usable default
    /// nor a shape to build one from.
    #[must_use]
    pub fn default_value(&self) -> Option<PvValue> {
        let bounds = self.bounds.unwrap_or_default();
        match (self.kind, &self.default) {
            (VariableKind::Scalar, Some(ValueSpec::Number(v))) => Some(PvValue::Scalar(*v)),
            (VariableKind::Scalar, None) => Some(PvValue::Scalar(0.0)),
            (VariableKind::Scalar, Some(ValueSpec::Array(_))) => None,
            (kind, Some(ValueSpec::Array(a))) => {
                let mut a = a.clone();
                if self.bounds.is_some() {
                    a.bounds = bounds;
                }
                Some(wrap_array(kind, a))
            }
            (kind, None) => self
                .shape
                .clone()
                .and_then(ArrayData::try_zeros)
                .map(|a| wrap_array(kind, a.with_bounds(bounds))),
            (_, Some(ValueSpec::Number(_))) => None,
        }
    }
}

fn wrap_array(kind: VariableKind, a: ArrayData) -> PvValue {
    if kind == VariableKind::Image {
        PvValue::Image(a)
    } else {
        PvValue::Array(a)
    }
}

fn default_serve() -> bool {
    true
}

/// Protocol binding of a variable or of a combined structure.
///
/// A binding whose key is not a variable name must carry `fields`: it then
/// describes a structure PV over the listed variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvBinding {
    /// External address; `{prefix}:{name}` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvname: Option<String>,
    pub protocol: Protocol,
    /// `false` marks an externally owned PV that is only monitored.
    #[serde(default = "default_serve")]
    pub serve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

impl PvBinding {
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self {
            pvname: None,
            protocol,
            serve: true,
            fields: None,
        }
    }

    #[must_use]
    pub fn ca() -> Self {
        Self::new(Protocol::ChannelAccess)
    }

    #[must_use]
    pub fn pva() -> Self {
        Self::new(Protocol::PvAccess)
    }

    #[must_use]
    pub fn with_pvname(mut self, pvname: impl Into<String>) -> Self {
        self.pvname = Some(pvname.into());
        self
    }

    /// Marks the PV as externally owned (monitor only).
    #[must_use]
    pub fn monitor_only(mut self) -> Self {
        self.serve = false;
        self
    }

    #[must_use]
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

fn default_summary_protocol() -> Protocol {
    Protocol::PvAccess
}

/// Metadata record describing the served variable set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// External address; `{prefix}:summary` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvname: Option<String>,
    #[serde(default = "default_summary_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Protocol environment overrides (`EPICS_CA_*`, `EPICS_PVA_*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolEnvironment {
    pub ca: BTreeMap<String, String>,
    pub pva: BTreeMap<String, String>,
}

impl ProtocolEnvironment {
    /// Overrides for one protocol.
    #[must_use]
    pub fn for_protocol(&self, protocol: Protocol) -> &BTreeMap<String, String> {
        match protocol {
            Protocol::ChannelAccess => &self.ca,
            Protocol::PvAccess => &self.pva,
        }
    }

    fn for_protocol_mut(&mut self, protocol: Protocol) -> &mut BTreeMap<String, String> {
        match protocol {
            Protocol::ChannelAccess => &mut self.ca,
            Protocol::PvAccess => &mut self.pva,
        }
    }

    /// Fills in protocol variables from `vars`; explicit entries win.
    ///
    /// `EPICS_CA_*` goes to Channel Access and `EPICS_PVA_*` to pvAccess.
    pub fn inherit<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let protocol = if key.starts_with("EPICS_PVA_") {
                Protocol::PvAccess
            } else if key.starts_with("EPICS_CA_") {
                Protocol::ChannelAccess
            } else {
                continue;
            };
            self.for_protocol_mut(protocol).entry(key).or_insert(value);
        }
    }
}

/// Protocol binding table plus summary and environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpicsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub pvs: BTreeMap<String, PvBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryRecord>,
    pub env: ProtocolEnvironment,
}

impl EpicsConfig {
    /// External address for `name` under `binding`.
    #[must_use]
    pub fn resolve_pvname(&self, name: &str, binding: &PvBinding) -> Option<String> {
        binding
            .pvname
            .clone()
            .or_else(|| self.prefix.as_ref().map(|p| format!("{p}:{name}")))
    }

    /// Server port for `protocol`, from the environment overrides.
    ///
    /// Returns `Err` with the raw value when the override is not a port.
    pub fn server_port(&self, protocol: Protocol) -> Result<u16, String> {
        server_port(protocol, self.env.for_protocol(protocol))
    }
}

/// Server port for `protocol` taken from `env`, or the protocol default.
///
/// Returns `Err` with the raw value when it is not a valid port.
pub fn server_port(protocol: Protocol, env: &BTreeMap<String, String>) -> Result<u16, String> {
    let (var, default) = match protocol {
        Protocol::ChannelAccess => (CA_SERVER_PORT_VAR, DEFAULT_CA_PORT),
        Protocol::PvAccess => (PVA_SERVER_PORT_VAR, DEFAULT_PVA_PORT),
    };
    match env.get(var) {
        Some(raw) => raw.trim().parse().map_err(|_| raw.clone()),
        None => Ok(default),
    }
}
