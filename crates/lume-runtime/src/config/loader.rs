//! Configuration loader with layered overrides.
//!
//! # Load Order
//!
//! 1. Default values (compile-time)
//! 2. Config file (TOML), if one is given and exists
//! 3. Environment variables (`LUME_*`)
//! 4. Inherited protocol environment (`EPICS_CA_*`, `EPICS_PVA_*`);
//!    entries already present in `[epics.env]` win
//!
//! Each layer overrides the previous.

use super::{ConfigError, ServerConfig};
use lume_types::Protocol;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Helper macro for parsing boolean environment variables.
macro_rules! parse_env_bool {
    ($field:expr, $var:literal) => {
        if let Ok(val) = std::env::var($var) {
            $field = parse_bool(&val)
                .ok_or_else(|| ConfigError::invalid_env_var($var, "expected bool"))?;
        }
    };
}

/// Helper macro for parsing numeric environment variables.
macro_rules! parse_env_num {
    ($field:expr, $var:literal) => {
        if let Ok(val) = std::env::var($var) {
            $field = val
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid_env_var($var, "expected a number"))?;
        }
    };
}

/// Configuration loader with builder pattern.
///
/// # Example
///
/// ```ignore
/// use lume_runtime::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_file("/etc/lume/server.toml")
///     .skip_env_vars()  // For testing
///     .load()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Config file path.
    file: Option<PathBuf>,

    /// Fail when the file does not exist.
    require_file: bool,

    /// Skip `LUME_*` and `EPICS_*` environment loading.
    skip_env: bool,
}

impl ConfigLoader {
    /// Creates a new loader with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the config file. A missing file is treated as empty.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Makes a missing config file an error.
    #[must_use]
    pub fn require_file(mut self) -> Self {
        self.require_file = true;
        self
    }

    /// Skips environment variable loading.
    ///
    /// Useful for testing with deterministic config.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Loads configuration with all layers merged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// an environment variable holds an invalid value.
    pub fn load(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.file {
            Some(path) => self.load_file(path)?.unwrap_or_default(),
            None => ServerConfig::default(),
        };

        if !self.skip_env {
            self.apply_env_vars(&mut config)?;
            config.epics.env.inherit(std::env::vars());
        }

        Ok(config)
    }

    fn load_file(&self, path: &Path) -> Result<Option<ServerConfig>, ConfigError> {
        if !path.exists() && !self.require_file {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;

        let config =
            ServerConfig::from_toml(&content).map_err(|e| ConfigError::parse_toml(path, e))?;

        debug!(path = %path.display(), variables = config.variables.len(), "loaded config file");
        Ok(Some(config))
    }

    /// Applies environment variable overrides.
    fn apply_env_vars(&self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        let settings = &mut config.settings;

        parse_env_bool!(settings.restart_listeners, "LUME_RESTART_LISTENERS");
        parse_env_num!(settings.coalesce_window_ms, "LUME_COALESCE_WINDOW_MS");
        parse_env_num!(settings.shutdown_timeout_ms, "LUME_SHUTDOWN_TIMEOUT_MS");

        if let Ok(val) = std::env::var("LUME_PROTOCOLS") {
            settings.protocols = parse_protocols(&val)
                .map_err(|e| ConfigError::invalid_env_var("LUME_PROTOCOLS", e.to_string()))?;
        }

        Ok(())
    }
}

/// Parses a comma separated protocol list such as `"ca,pva"`.
///
/// Duplicates are dropped, order is kept.
///
/// # Errors
///
/// Returns the first unknown protocol name.
pub fn parse_protocols(s: &str) -> Result<Vec<Protocol>, lume_types::UnknownProtocol> {
    let mut out = Vec::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let protocol: Protocol = part.parse()?;
        if !out.contains(&protocol) {
            out.push(protocol);
        }
    }
    Ok(out)
}

/// Parses a boolean from string.
///
/// Accepts: "true", "false", "1", "0", "yes", "no", "on", "off"
/// (case-insensitive).
fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("server.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_defaults_only() {
        let config = ConfigLoader::new().skip_env_vars().load().unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn load_file() {
        let temp = TempDir::new().unwrap();
        let path = create_config_file(
            temp.path(),
            r#"
[settings]
coalesce_window_ms = 0

[variables.input1]
kind = "scalar"
role = "input"
default = 1.0
range = [0.0, 256.0]

[epics.pvs.input1]
protocol = "ca"
pvname = "demo:input1"
"#,
        );

        let config = ConfigLoader::new()
            .with_file(&path)
            .skip_env_vars()
            .load()
            .unwrap();

        assert_eq!(config.settings.coalesce_window_ms, 0);
        assert_eq!(config.settings.shutdown_timeout_ms, 5_000);
        assert!(config.variables.contains_key("input1"));
        assert_eq!(
            config.epics.pvs["input1"].pvname.as_deref(),
            Some("demo:input1")
        );
    }

    #[test]
    fn missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ConfigLoader::new()
            .with_file(temp.path().join("absent.toml"))
            .skip_env_vars()
            .load()
            .unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn missing_required_file_fails() {
        let temp = TempDir::new().unwrap();
        let err = ConfigLoader::new()
            .with_file(temp.path().join("absent.toml"))
            .require_file()
            .skip_env_vars()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn invalid_toml_fails() {
        let temp = TempDir::new().unwrap();
        let path = create_config_file(temp.path(), "[settings\nprotocols = 3");
        let err = ConfigLoader::new()
            .with_file(&path)
            .skip_env_vars()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
    }

    #[test]
    fn protocol_list_parsing() {
        assert_eq!(
            parse_protocols("pva, ca,pva").unwrap(),
            vec![Protocol::PvAccess, Protocol::ChannelAccess]
        );
        assert!(parse_protocols("").unwrap().is_empty());
        assert!(parse_protocols("ca,modbus").is_err());
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
