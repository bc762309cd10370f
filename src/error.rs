//! Error handling for the admission controller.

use std::fmt;

use crate::config::ConfigError;

/// Errors that can occur while constructing or running the controller
#[derive(Debug, Clone)]
pub enum GatekeeperError {
    /// Configuration validation error
    Config(String),
    /// Shared-store connection or script error
    Redis(String),
    /// Target URL missing or unparsable at construction
    InvalidTargetUrl(String),
    /// Identity header name unset or not a valid header name
    MissingHeaderName,
    /// Listener or serve I/O error
    Io(String),
}

impl fmt::Display for GatekeeperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatekeeperError::Config(msg) => write!(f, "Configuration error: {}", msg),
            GatekeeperError::Redis(msg) => write!(f, "Redis error: {}", msg),
            GatekeeperError::InvalidTargetUrl(url) => {
                write!(f, "Invalid target URL: {:?}", url)
            }
            GatekeeperError::MissingHeaderName => {
                write!(f, "Identity header name is not set")
            }
            GatekeeperError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for GatekeeperError {}

impl From<ConfigError> for GatekeeperError {
    fn from(error: ConfigError) -> Self {
        GatekeeperError::Config(error.to_string())
    }
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(error: redis::RedisError) -> Self {
        GatekeeperError::Redis(error.to_string())
    }
}
