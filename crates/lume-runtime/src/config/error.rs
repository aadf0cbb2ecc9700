//! Configuration errors.
//!
//! Two layers fail independently:
//!
//! | Type | When | Prefix |
//! |------|------|--------|
//! | [`ConfigError`] | reading / parsing a file, bad env var | `CONFIG_` |
//! | [`ConfigurationError`] | building the registry from a parsed config | `CONFIGURATION_` |
//!
//! Both are fatal: the server refuses to start and nothing is bound.

use crate::registry::ValidationError;
use lume_types::{ErrorCode, Protocol, VariableKind};
use std::path::PathBuf;
use thiserror::Error;

/// Config file loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config file '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Invalid environment variable value.
    #[error("invalid value for environment variable '{name}': {message}")]
    InvalidEnvVar { name: String, message: String },
}

impl ConfigError {
    /// Creates a read file error.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// Creates a parse TOML error.
    pub fn parse_toml(path: impl Into<PathBuf>, source: toml::de::Error) -> Self {
        Self::ParseToml {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid env var error.
    pub fn invalid_env_var(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEnvVar {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "CONFIG_READ_FILE",
            Self::ParseToml { .. } => "CONFIG_PARSE_TOML",
            Self::InvalidEnvVar { .. } => "CONFIG_INVALID_ENV_VAR",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Semantic configuration problem found while building the registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("no protocols enabled")]
    NoProtocols,

    #[error("variable '{variable}' has no protocol binding")]
    MissingBinding { variable: String },

    #[error("binding '{name}' names no variable and has no fields")]
    UnknownBindingTarget { name: String },

    #[error("binding '{name}' has no pvname and no prefix is configured")]
    MissingPvName { name: String },

    #[error("pvname '{pvname}' is bound more than once over {protocol}")]
    DuplicatePvName { pvname: String, protocol: Protocol },

    #[error("variable '{variable}' references unknown parent '{parent}'")]
    UnresolvedParent { variable: String, parent: String },

    #[error("parent '{parent}' of '{variable}' is a {kind}, expected image or array")]
    InvalidParent {
        variable: String,
        parent: String,
        kind: VariableKind,
    },

    #[error("variable '{variable}' is bound to a parent but has no axis")]
    MissingAxis { variable: String },

    #[error("only scalar variables may bind to a parent ('{variable}')")]
    NonScalarChild { variable: String },

    #[error("scalar input '{variable}' has no range")]
    MissingRange { variable: String },

    #[error("variable '{variable}' has an empty range [{min}, {max}]")]
    InvalidRange { variable: String, min: f64, max: f64 },

    #[error("variable '{variable}' has no usable default (array and image variables need a default or a shape)")]
    MissingDefault { variable: String },

    #[error("default of '{variable}' is invalid: {source}")]
    InvalidDefault {
        variable: String,
        #[source]
        source: ValidationError,
    },

    #[error("structure '{structure}' lists unknown field '{field}'")]
    UnknownField { structure: String, field: String },

    #[error("structure '{structure}' has no fields")]
    EmptyStructure { structure: String },

    #[error("structure '{structure}' is bound over {protocol}, which cannot carry structures")]
    StructureUnsupported {
        structure: String,
        protocol: Protocol,
    },
}

impl ErrorCode for ConfigurationError {
    fn code(&self) -> &'static str {
        match self {
            Self::NoProtocols => "CONFIGURATION_NO_PROTOCOLS",
            Self::MissingBinding { .. } => "CONFIGURATION_MISSING_BINDING",
            Self::UnknownBindingTarget { .. } => "CONFIGURATION_UNKNOWN_BINDING_TARGET",
            Self::MissingPvName { .. } => "CONFIGURATION_MISSING_PV_NAME",
            Self::DuplicatePvName { .. } => "CONFIGURATION_DUPLICATE_PV_NAME",
            Self::UnresolvedParent { .. } => "CONFIGURATION_UNRESOLVED_PARENT",
            Self::InvalidParent { .. } => "CONFIGURATION_INVALID_PARENT",
            Self::MissingAxis { .. } => "CONFIGURATION_MISSING_AXIS",
            Self::NonScalarChild { .. } => "CONFIGURATION_NON_SCALAR_CHILD",
            Self::MissingRange { .. } => "CONFIGURATION_MISSING_RANGE",
            Self::InvalidRange { .. } => "CONFIGURATION_INVALID_RANGE",
            Self::MissingDefault { .. } => "CONFIGURATION_MISSING_DEFAULT",
            Self::InvalidDefault { .. } => "CONFIGURATION_INVALID_DEFAULT",
            Self::UnknownField { .. } => "CONFIGURATION_UNKNOWN_FIELD",
            Self::EmptyStructure { .. } => "CONFIGURATION_EMPTY_STRUCTURE",
            Self::StructureUnsupported { .. } => "CONFIGURATION_STRUCTURE_UNSUPPORTED",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lume_types::assert_error_codes;

    fn all_configuration_variants() -> Vec<ConfigurationError> {
        let v = || "v".to_string();
        vec![
            ConfigurationError::NoProtocols,
            ConfigurationError::MissingBinding { variable: v() },
            ConfigurationError::UnknownBindingTarget { name: v() },
            ConfigurationError::MissingPvName { name: v() },
            ConfigurationError::DuplicatePvName {
                pvname: v(),
                protocol: Protocol::ChannelAccess,
            },
            ConfigurationError::UnresolvedParent {
                variable: v(),
                parent: v(),
            },
            ConfigurationError::InvalidParent {
                variable: v(),
                parent: v(),
                kind: VariableKind::Scalar,
            },
            ConfigurationError::MissingAxis { variable: v() },
            ConfigurationError::NonScalarChild { variable: v() },
            ConfigurationError::MissingRange { variable: v() },
            ConfigurationError::InvalidRange {
                variable: v(),
                min: 1.0,
                max: 0.0,
            },
            ConfigurationError::MissingDefault { variable: v() },
            ConfigurationError::InvalidDefault {
                variable: v(),
                source: ValidationError::UnknownVariable { name: v() },
            },
            ConfigurationError::UnknownField {
                structure: v(),
                field: v(),
            },
            ConfigurationError::EmptyStructure { structure: v() },
            ConfigurationError::StructureUnsupported {
                structure: v(),
                protocol: Protocol::ChannelAccess,
            },
        ]
    }

    #[test]
    fn configuration_error_codes() {
        let all = all_configuration_variants();
        assert_error_codes(&all, "CONFIGURATION_");
        assert!(all.iter().all(|e| !e.is_recoverable()));
    }

    #[test]
    fn config_error_codes() {
        let io = || std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let parse = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let all = vec![
            ConfigError::read_file("/tmp/a.toml", io()),
            ConfigError::parse_toml("/tmp/a.toml", parse),
            ConfigError::invalid_env_var("LUME_PROTOCOLS", "bad"),
        ];
        assert_error_codes(&all, "CONFIG_");
    }

    #[test]
    fn display_names_the_offender() {
        let err = ConfigurationError::DuplicatePvName {
            pvname: "test:a".into(),
            protocol: Protocol::PvAccess,
        };
        assert_eq!(
            err.to_string(),
            "pvname 'test:a' is bound more than once over pva"
        );
    }
}
