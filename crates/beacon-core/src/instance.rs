//! The record of this agent as the registry sees it.

use serde::Serialize;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Version string reported for this agent, e.g. `beacon/0.1.0 (linux)`.
pub fn runtime_version() -> String {
    format!(
        "beacon/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

/// Identity, port and liveness of one registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub version: String,
    /// Epoch milliseconds of the last successful heartbeat (or registration).
    pub last_heartbeat_ms: Option<i64>,
    /// Epoch milliseconds of the current registration; `None` when not registered.
    pub registered_at_ms: Option<i64>,
}

impl Instance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            port,
            version: runtime_version(),
            last_heartbeat_ms: None,
            registered_at_ms: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered_at_ms.is_some()
    }

    /// Time since the last heartbeat, relative to `now_ms`.
    pub fn heartbeat_age_ms(&self, now_ms: i64) -> Option<i64> {
        self.last_heartbeat_ms.map(|last| (now_ms - last).max(0))
    }
}
