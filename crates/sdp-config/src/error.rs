//! Error types for the SDP configuration database.

use thiserror::Error;

/// Result type alias for configuration database operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while talking to the configuration database.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// A `create_*` call found the key already present.
    #[error("{kind} {key} already exists")]
    Collision { kind: &'static str, key: String },

    /// An `update_*` call found the key missing. Callers treat this as
    /// "create instead".
    #[error("{kind} {key} vanished")]
    Vanished { kind: &'static str, key: String },
}

impl ConfigError {
    pub fn is_collision(&self) -> bool {
        matches!(self, ConfigError::Collision { .. })
    }

    pub fn is_vanished(&self) -> bool {
        matches!(self, ConfigError::Vanished { .. })
    }
}
