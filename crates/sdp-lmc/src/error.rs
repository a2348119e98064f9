//! Error types for the SDP devices.

use sdp_config::ConfigError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Reason code carried by every failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reason {
    #[serde(rename = "API_CommandNotAllowed")]
    CommandNotAllowed,
    #[serde(rename = "API_CommandFailed")]
    CommandFailed,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::CommandNotAllowed => "API_CommandNotAllowed",
            Reason::CommandFailed => "API_CommandFailed",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command failure as seen by the caller.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command's guard rejected the current device state.
    #[error("{description}")]
    NotAllowed { description: String, origin: String },

    /// Payload validation or a domain-consistency check failed.
    #[error("{description}")]
    Failed { description: String, origin: String },

    #[error("configuration database error: {0}")]
    Config(#[from] ConfigError),
}

impl CommandError {
    /// Build (and log) a `CommandNotAllowed` failure.
    pub fn not_allowed(description: impl Into<String>, origin: impl Into<String>) -> Self {
        let description = description.into();
        let origin = origin.into();
        error!(reason = %Reason::CommandNotAllowed, %description, %origin, "command rejected");
        CommandError::NotAllowed {
            description,
            origin,
        }
    }

    /// Build (and log) a `CommandFailed` failure.
    pub fn failed(description: impl Into<String>, origin: impl Into<String>) -> Self {
        let description = description.into();
        let origin = origin.into();
        error!(reason = %Reason::CommandFailed, %description, %origin, "command failed");
        CommandError::Failed {
            description,
            origin,
        }
    }

    /// Store failures are reported as `CommandFailed`.
    pub fn reason(&self) -> Reason {
        match self {
            CommandError::NotAllowed { .. } => Reason::CommandNotAllowed,
            CommandError::Failed { .. } | CommandError::Config(_) => Reason::CommandFailed,
        }
    }

    pub fn description(&self) -> String {
        match self {
            CommandError::NotAllowed { description, .. }
            | CommandError::Failed { description, .. } => description.clone(),
            CommandError::Config(e) => e.to_string(),
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            CommandError::NotAllowed { origin, .. } | CommandError::Failed { origin, .. } => origin,
            CommandError::Config(_) => "sdp_config",
        }
    }
}

/// Result type alias for command execution.
pub type CommandResult<T> = Result<T, CommandError>;

/// Errors raised while constructing, running or tearing down a device.
#[derive(Debug, Error)]
pub enum LmcError {
    #[error("configuration database error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid device name: {0}")]
    DeviceName(String),

    #[error("failed to spawn reconciliation worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{0} entry is missing from the configuration database")]
    MissingEntry(&'static str),

    #[error("reconciliation pass panicked: {0}")]
    Panicked(String),
}

/// Failure to read or write a published attribute by name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttributeError {
    #[error("attribute {0} not found")]
    NotFound(String),

    #[error("attribute {0} is read-only")]
    ReadOnly(String),

    #[error("invalid value for attribute {attribute}: {value}")]
    InvalidValue { attribute: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let e = CommandError::not_allowed("Command On not allowed when device state is ON", "x");
        assert_eq!(e.reason(), Reason::CommandNotAllowed);
        assert_eq!(e.reason().as_str(), "API_CommandNotAllowed");

        let e = CommandError::failed("Configuration validation failed", "sdp_lmc::validation");
        assert_eq!(e.reason(), Reason::CommandFailed);
        assert_eq!(e.origin(), "sdp_lmc::validation");
    }

    #[test]
    fn test_store_errors_report_command_failed() {
        let e: CommandError = ConfigError::Collision {
            kind: "SBI",
            key: "sbi-1".into(),
        }
        .into();
        assert_eq!(e.reason(), Reason::CommandFailed);
        assert_eq!(e.description(), "SBI sbi-1 already exists");
    }

    #[test]
    fn test_reason_serializes_as_api_code() {
        let json = serde_json::to_string(&Reason::CommandFailed).unwrap();
        assert_eq!(json, "\"API_CommandFailed\"");
    }
}
