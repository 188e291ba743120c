//! Error types
//!
//! "No signal" and "not enough bars" are not errors and never show up here.

/// Failure of an external collaborator call
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0} unavailable")]
    Unavailable(String),

    #[error("{call} timed out after {after_ms}ms")]
    Timeout { call: String, after_ms: u64 },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Invalid or unloadable configuration, fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("position {0} is already being managed")]
    DuplicatePosition(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
