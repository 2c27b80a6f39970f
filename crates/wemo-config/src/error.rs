//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;
use wemo_core::EndpointError;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("secret '{key}' not found in secrets.yaml")]
    SecretNotFound { key: String },

    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// A `static` entry could not be parsed as `host` or `host:port`
    #[error("invalid static entry #{index} '{value}': {source}")]
    InvalidStaticEntry {
        index: usize,
        value: String,
        #[source]
        source: EndpointError,
    },
}
