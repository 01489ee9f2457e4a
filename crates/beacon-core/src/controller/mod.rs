//! Connection controller.
//!
//! [`AgentController`] drives the agent through its lifecycle: pick a port,
//! start the listener, register, heartbeat, reconnect after a failure streak,
//! and unregister on request or shutdown. The handle is cheap to clone; all
//! state lives in a single background task.
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon_core::{AgentConfig, AgentController, MemorySessionStore, RegistryClient};
//! use std::sync::Arc;
//!
//! let config = AgentConfig::default();
//! let registry = Arc::new(RegistryClient::from_config(&config)?);
//! let controller = AgentController::spawn(config, registry, Arc::new(MemorySessionStore::new()));
//!
//! controller.initialize().await?;
//! assert!(controller.state().is_connected());
//! controller.shutdown().await;
//! ```

mod actor;
mod events;
mod state;

pub use events::{ControllerEvent, EVENT_CHANNEL_CAPACITY};
pub use state::{ControllerSnapshot, ControllerState, HeartbeatStats};

use crate::client::{HealthResponse, RegistryApi};
use crate::config::AgentConfig;
use crate::instance::Instance;
use crate::session::SessionStore;
use crate::{BeaconError, Result};
use actor::{Command, ControllerActor};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Handle to a running controller task.
#[derive(Clone)]
pub struct AgentController {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ControllerEvent>,
    snapshot: watch::Receiver<ControllerSnapshot>,
    registry: Arc<dyn RegistryApi>,
}

impl AgentController {
    /// Start the controller task on the current runtime.
    ///
    /// The session store is read once here; `resume` decides from that copy.
    pub fn spawn(
        mut config: AgentConfig,
        registry: Arc<dyn RegistryApi>,
        session: Arc<dyn SessionStore>,
    ) -> Self {
        config.refresh_display_name();
        registry.configure(&config.server_url(), config.api_key.as_deref());

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(ControllerSnapshot {
            server_url: config.server_url(),
            ..ControllerSnapshot::default()
        });

        let actor = ControllerActor::new(
            config,
            Arc::clone(&registry),
            session,
            events.clone(),
            snapshot_tx,
        );
        tokio::spawn(actor.run(commands_rx));

        Self {
            commands: commands_tx,
            events,
            snapshot: snapshot_rx,
            registry,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| BeaconError::ControllerClosed)?;
        rx.await.map_err(|_| BeaconError::ControllerClosed)
    }

    /// Run the initialize flow and wait for it to finish.
    ///
    /// Resolves once the agent is registered (and heartbeating when
    /// `auto_register` is on), or with the error that moved it to `Failed`.
    /// Fails with [`BeaconError::AlreadyActive`] while a flow is running or
    /// the agent is already connected.
    pub async fn initialize(&self) -> Result<()> {
        self.request(|reply| Command::Initialize { reply }).await?
    }

    /// Unregister and release the listener.
    ///
    /// Always ends in `Unregistered`; a registry that cannot be reached is
    /// logged, not returned.
    pub async fn unregister(&self) -> Result<()> {
        self.request(|reply| Command::Unregister { reply }).await?
    }

    /// Re-run initialize if the previous session was connected and
    /// `auto_restore` is on. Returns whether a restore was attempted.
    pub async fn resume(&self) -> Result<bool> {
        match self.request(|reply| Command::Resume { reply }).await? {
            None => Ok(false),
            Some(done) => {
                done.await.map_err(|_| BeaconError::ControllerClosed)??;
                Ok(true)
            }
        }
    }

    /// Start heartbeats for an agent registered with `auto_register` off.
    pub async fn start_heartbeat(&self) -> Result<()> {
        self.request(|reply| Command::StartHeartbeat { reply }).await?
    }

    /// Replace the configuration. Only allowed while no flow is running and
    /// the agent is not connected.
    pub async fn update_config(&self, config: AgentConfig) -> Result<()> {
        self.request(|reply| Command::UpdateConfig {
            config: Box::new(config),
            reply,
        })
        .await?
    }

    /// Query registry health directly. Does not touch controller state.
    pub async fn health_check(&self) -> Result<HealthResponse> {
        self.registry.health().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Watch channel carrying the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ControllerState {
        self.snapshot.borrow().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.snapshot.borrow().last_error.clone()
    }

    pub fn instance(&self) -> Option<Instance> {
        self.snapshot.borrow().instance.clone()
    }

    pub fn stats(&self) -> HeartbeatStats {
        self.snapshot.borrow().stats
    }

    /// Unregister if needed and stop the controller task. Other handles
    /// report [`BeaconError::ControllerClosed`] afterwards.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}
