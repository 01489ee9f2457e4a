//! Controller states and the read-only snapshot published to observers.

use crate::instance::Instance;
use serde::Serialize;

/// Lifecycle state of the controller. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    #[default]
    Uninitialized,
    Initializing,
    FindingPort,
    StartingListener,
    Registering,
    Registered,
    Heartbeating,
    Unregistering,
    Unregistered,
    Failed,
    Disconnected,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Uninitialized => "uninitialized",
            ControllerState::Initializing => "initializing",
            ControllerState::FindingPort => "finding_port",
            ControllerState::StartingListener => "starting_listener",
            ControllerState::Registering => "registering",
            ControllerState::Registered => "registered",
            ControllerState::Heartbeating => "heartbeating",
            ControllerState::Unregistering => "unregistering",
            ControllerState::Unregistered => "unregistered",
            ControllerState::Failed => "failed",
            ControllerState::Disconnected => "disconnected",
        }
    }

    /// An initialize flow is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ControllerState::Initializing
                | ControllerState::FindingPort
                | ControllerState::StartingListener
                | ControllerState::Registering
        )
    }

    /// Registered with the registry, with or without heartbeats.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ControllerState::Registered | ControllerState::Heartbeating
        )
    }

    /// States from which a new initialize flow may start.
    pub fn can_initialize(&self) -> bool {
        matches!(
            self,
            ControllerState::Uninitialized
                | ControllerState::Failed
                | ControllerState::Unregistered
                | ControllerState::Disconnected
        )
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Heartbeat counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatStats {
    pub successes: u64,
    pub failures: u64,
    /// Failures since the last success; reset on success and on registration.
    pub consecutive_failures: u32,
    pub last_success_ms: Option<i64>,
}

/// Everything an observer may want to know, copied out after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub state: ControllerState,
    pub instance: Option<Instance>,
    pub stats: HeartbeatStats,
    pub last_error: Option<String>,
    pub listener_port: Option<u16>,
    pub server_url: String,
}
