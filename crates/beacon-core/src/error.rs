//! Error types for the Beacon agent.
//!
//! Setup-phase failures (configuration, port, listener, registration) abort
//! the active controller flow. Network failures carry a [`NetworkErrorKind`]
//! so callers can tell an unreachable registry from a rejected request.

use thiserror::Error;

/// Classification of an outbound registry call that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// No reachable server, or no response before the timeout.
    Connection,
    /// The server answered with a non-2xx status.
    Protocol,
    /// The exchange succeeded but the payload was not valid JSON.
    Parse,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkErrorKind::Connection => write!(f, "connection"),
            NetworkErrorKind::Protocol => write!(f, "protocol"),
            NetworkErrorKind::Parse => write!(f, "parse"),
        }
    }
}

/// Main error type for the Beacon agent.
#[derive(Debug, Error)]
pub enum BeaconError {
    // Setup errors
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("No available port in range {min}-{max}")]
    PortUnavailable { min: u16, max: u16 },

    #[error("Failed to start listener on port {port}: {message}")]
    ListenerBind { port: u16, message: String },

    #[error("Registration rejected: {message}")]
    RegistrationRejected { message: String },

    // Network errors
    #[error("Network {kind} error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("Heartbeat failed {failures} times in a row")]
    HeartbeatStreak { failures: u32 },

    #[error("Unregister failed: {message}")]
    Unregister { message: String },

    // Controller errors
    #[error("Controller is busy ({state})")]
    AlreadyActive { state: String },

    #[error("Operation not allowed in state {state}: {message}")]
    InvalidState { state: String, message: String },

    #[error("Controller task has stopped")]
    ControllerClosed,

    // Persistence errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for Beacon operations.
pub type Result<T> = std::result::Result<T, BeaconError>;

impl From<std::io::Error> for BeaconError {
    fn from(err: std::io::Error) -> Self {
        BeaconError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(err: serde_json::Error) -> Self {
        BeaconError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for BeaconError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            NetworkErrorKind::Parse
        } else if err.is_status() {
            NetworkErrorKind::Protocol
        } else {
            NetworkErrorKind::Connection
        };
        BeaconError::Network {
            kind,
            message: err.to_string(),
        }
    }
}

impl BeaconError {
    /// Shorthand for a network error of the given kind.
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        BeaconError::Network {
            kind,
            message: message.into(),
        }
    }

    /// Network error kind, if this is a network error.
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            BeaconError::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if this error is worth retrying later.
    ///
    /// Only connection-level failures are transient; a rejected or
    /// unparseable response will not change on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BeaconError::Network {
                kind: NetworkErrorKind::Connection,
                ..
            } | BeaconError::HeartbeatStreak { .. }
        )
    }

    /// Whether this error belongs to the setup phase of the controller.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            BeaconError::ConfigInvalid { .. }
                | BeaconError::PortUnavailable { .. }
                | BeaconError::ListenerBind { .. }
                | BeaconError::RegistrationRejected { .. }
        )
    }
}
