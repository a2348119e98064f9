//! Device settings, loaded from TOML.
//!
//! Settings are resolved once at startup and handed to each device when it
//! is constructed. Every field has a default, so an empty file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sdp_config::{ConfigDb, ConfigResult};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LmcSettings {
    pub store: StoreSettings,
    pub event_loop: EventLoopSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Persistent redb file.
    Redb,
    /// Ephemeral in-memory database (tests, demos).
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redb,
            path: PathBuf::from("/var/lib/sdp-lmc/config.redb"),
        }
    }
}

impl StoreSettings {
    /// Open the configured backend.
    pub fn open(&self) -> ConfigResult<ConfigDb> {
        match self.backend {
            StoreBackend::Redb => {
                info!(path = %self.path.display(), "opening config db");
                ConfigDb::open(&self.path)
            }
            StoreBackend::Memory => {
                info!("opening in-memory config db");
                ConfigDb::open_in_memory()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopSettings {
    /// Run the reconciliation worker. When off, attributes only change on
    /// an explicit `update_attributes()` call.
    pub enabled: bool,
    /// Upper bound on joining the worker at shutdown.
    pub join_timeout_ms: u64,
    /// Upper bound on a command waiting for its change to be applied.
    /// Absent means wait until the worker publishes.
    pub command_wait_timeout_ms: Option<u64>,
}

impl Default for EventLoopSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            join_timeout_ms: 5000,
            command_wait_timeout_ms: None,
        }
    }
}

impl EventLoopSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn command_wait_timeout(&self) -> Option<Duration> {
        self.command_wait_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

impl LmcSettings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings: LmcSettings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Settings for tests: in-memory store, worker on or off.
    pub fn in_memory(event_loop: bool) -> Self {
        let mut settings = Self::default();
        settings.store.backend = StoreBackend::Memory;
        settings.event_loop.enabled = event_loop;
        settings
    }
}
