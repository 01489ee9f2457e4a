//! Events broadcast by the controller to its subscribers.

use super::state::ControllerState;
use crate::listener::InboundRequest;
use std::time::Duration;

/// Capacity of the event broadcast channel. Slow subscribers lag, they do
/// not block the controller.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    Registered {
        instance_id: String,
        port: u16,
    },
    Unregistered,
    HeartbeatSucceeded {
        count: u64,
        timestamp_ms: i64,
    },
    HeartbeatFailed {
        consecutive: u32,
        error: String,
    },
    /// The heartbeat streak tripped; a new initialize flow starts after `backoff`.
    Reconnecting {
        backoff: Duration,
    },
    Error {
        message: String,
    },
    /// A request arrived on the local listener.
    RequestReceived(InboundRequest),
}

impl ControllerEvent {
    /// The target state, for `StateChanged` events.
    pub fn new_state(&self) -> Option<ControllerState> {
        match self {
            ControllerEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        }
    }
}
