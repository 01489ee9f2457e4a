//! Beacon Core - headless agent that keeps itself registered with a registry.
//!
//! The agent picks a free local port (stable per project name when possible),
//! starts a small HTTP listener on it, registers with a remote registry and
//! keeps the registration alive with periodic heartbeats. After a streak of
//! failed heartbeats it backs off and re-runs the whole flow. Connection state
//! is persisted so a restarted agent can restore itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon_core::{AgentConfig, AgentController, JsonSessionStore, RegistryClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> beacon_core::Result<()> {
//!     let config = AgentConfig::default();
//!     let registry = Arc::new(RegistryClient::from_config(&config)?);
//!     let session = Arc::new(JsonSessionStore::open_default()?);
//!
//!     let controller = AgentController::spawn(config, registry, session);
//!     if !controller.resume().await? {
//!         controller.initialize().await?;
//!     }
//!
//!     let mut events = controller.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod instance;
pub mod listener;
pub mod persistence;
pub mod port;
pub mod session;

// Re-export commonly used types
pub use client::{HealthResponse, InstanceCounts, RegistryApi, RegistryClient, RegistryResponse};
pub use config::AgentConfig;
pub use controller::{
    AgentController, ControllerEvent, ControllerSnapshot, ControllerState, HeartbeatStats,
};
pub use error::{BeaconError, NetworkErrorKind, Result};
pub use instance::Instance;
pub use listener::{CommandListener, InboundRequest};
pub use session::{JsonSessionStore, MemorySessionStore, SessionState, SessionStore};
