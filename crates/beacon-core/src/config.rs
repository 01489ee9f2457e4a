//! Centralized configuration for the Beacon agent.
//!
//! Fixed tuning constants live in unit structs grouped by concern; the
//! user-editable settings live in [`AgentConfig`], which is persisted as JSON.

use crate::persistence;
use crate::{BeaconError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "beacon";
    pub const CONFIG_FILENAME: &'static str = "config.json";
    pub const SESSION_FILENAME: &'static str = "session.json";

    /// Directory holding the config and session files (`<config dir>/beacon`).
    pub fn data_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(Self::APP_NAME))
    }

    pub fn default_config_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join(Self::CONFIG_FILENAME))
    }

    pub fn default_session_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join(Self::SESSION_FILENAME))
    }
}

/// Registry client settings.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const API_KEY_HEADER: &'static str = "X-API-Key";
    pub const USER_AGENT: &'static str = concat!("beacon/", env!("CARGO_PKG_VERSION"));
}

/// Inbound HTTP listener settings.
pub struct ListenerConfig;

impl ListenerConfig {
    /// Sleep between accept polls when no connection is pending.
    pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Per-read timeout so the reader can observe shutdown.
    pub const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);
    /// Hard cap on bytes read from a single connection.
    pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;
    /// How long `stop()` waits for the accept thread before detaching it.
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
    /// Capacity of the queue feeding parsed requests to the controller.
    pub const QUEUE_CAPACITY: usize = 64;
    pub const ACK_BODY: &'static str = r#"{"success":true,"message":"Request received"}"#;
}

/// Heartbeat and reconnect behaviour.
pub struct HeartbeatConfig;

impl HeartbeatConfig {
    pub const FAILURE_THRESHOLD: u32 = 3;
    pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
    pub const MIN_INTERVAL_MS: u64 = 1000;
    pub const DEFAULT_INTERVAL_MS: u64 = 30_000;
}

/// Port allocation bounds and search parameters.
pub struct PortConfig;

impl PortConfig {
    pub const MIN_ALLOWED: u16 = 1024;
    pub const MAX_ALLOWED: u16 = 65535;
    pub const DEFAULT_MIN: u16 = 8100;
    pub const DEFAULT_MAX: u16 = 8200;
    /// Offsets probed on each side of the recommended port.
    pub const RECOMMENDED_PROBE_SPAN: i32 = 50;
    pub const RANDOM_ATTEMPTS: u32 = 10;
    pub const RANDOM_SCAN_SPAN: i32 = 10;
}

/// User-editable agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_host: String,
    pub server_port: u16,
    pub api_key: Option<String>,
    pub instance_id: String,
    pub project_name: String,
    pub min_port: u16,
    pub max_port: u16,
    pub auto_register: bool,
    pub auto_restore: bool,
    pub heartbeat_interval_ms: u64,
    pub verbose_logging: bool,
    /// `<project>@<host>`, recomputed from the environment and never persisted.
    #[serde(skip)]
    pub display_name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let project_name = AppConfig::APP_NAME.to_string();
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 3000,
            api_key: None,
            instance_id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name_for(&project_name),
            project_name,
            min_port: PortConfig::DEFAULT_MIN,
            max_port: PortConfig::DEFAULT_MAX,
            auto_register: true,
            auto_restore: true,
            heartbeat_interval_ms: HeartbeatConfig::DEFAULT_INTERVAL_MS,
            verbose_logging: false,
        }
    }
}

impl AgentConfig {
    /// Load a config file, or `None` if it doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let config: Option<Self> = persistence::read_json(path)?;
        Ok(config.map(|mut config| {
            config.refresh_display_name();
            config
        }))
    }

    /// Persist the config atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        persistence::write_json(path, self)
    }

    /// Recompute the normalized display name after the project name changes.
    pub fn refresh_display_name(&mut self) {
        self.display_name = display_name_for(&self.project_name);
    }

    /// Base URL of the registry service.
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.server_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check every invariant, reporting the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(BeaconError::ConfigInvalid {
                message: message.to_string(),
            })
        };

        if self.server_host.trim().is_empty() {
            return invalid("server_host must not be empty");
        }
        if self.server_port == 0 {
            return invalid("server_port must be between 1 and 65535");
        }
        if self.instance_id.trim().is_empty() {
            return invalid("instance_id must not be empty");
        }
        if self.project_name.trim().is_empty() {
            return invalid("project_name must not be empty");
        }
        if self.min_port < PortConfig::MIN_ALLOWED {
            return invalid("min_port must be at least 1024");
        }
        if self.max_port < self.min_port {
            return invalid("max_port must not be below min_port");
        }
        if self.heartbeat_interval_ms < HeartbeatConfig::MIN_INTERVAL_MS {
            return invalid("heartbeat_interval_ms must be at least 1000");
        }
        Ok(())
    }
}

fn display_name_for(project_name: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", project_name, host.trim())
}
