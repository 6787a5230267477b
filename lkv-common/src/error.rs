//! # Configuration Errors
//!
//! Every variant here is fatal at process startup: without a valid endpoint
//! list and the required timing settings no client can be built.

use thiserror::Error;

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating [`crate::Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key was absent from both the environment and the file.
    #[error("required setting {0} is missing")]
    Missing(String),

    /// A key was present but could not be parsed or violated a bound.
    #[error("setting {name} has invalid value {value:?}")]
    Invalid { name: String, value: String },

    /// Host and port lists must pair up one to one.
    #[error("endpoint lists differ in length: {hosts} hosts, {ports} ports")]
    EndpointMismatch { hosts: usize, ports: usize },

    /// At least one endpoint is needed.
    #[error("no endpoints configured")]
    NoEndpoints,

    /// Config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not a JSON object of settings.
    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(name: &str, value: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name: name.to_string(),
            value: value.into(),
        }
    }
}
