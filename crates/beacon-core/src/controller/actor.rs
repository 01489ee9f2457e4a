//! The controller task.
//!
//! One tokio task owns every piece of mutable controller state. Commands from
//! handles, parsed requests from the listener thread and completions of
//! spawned registry calls all arrive over channels and are handled one at a
//! time, so state is never touched from two places at once.
//!
//! Register and heartbeat calls run as spawned futures tagged with the flow
//! epoch in effect when they started. Stopping, reconnecting or starting a new
//! flow bumps the epoch, which turns any completion still in flight into a
//! no-op.

use super::events::ControllerEvent;
use super::state::{ControllerSnapshot, ControllerState, HeartbeatStats};
use crate::client::{RegistryApi, RegistryResponse};
use crate::config::{AgentConfig, HeartbeatConfig, ListenerConfig, NetworkConfig};
use crate::error::NetworkErrorKind;
use crate::instance::{now_millis, Instance};
use crate::listener::{CommandListener, InboundRequest};
use crate::session::{SessionState, SessionStore};
use crate::{port, BeaconError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) type InitReply = oneshot::Sender<Result<()>>;

pub(crate) enum Command {
    Initialize {
        reply: InitReply,
    },
    Unregister {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Replies with a receiver for the started flow, or `None` if no restore
    /// was needed.
    Resume {
        reply: oneshot::Sender<Option<oneshot::Receiver<Result<()>>>>,
    },
    StartHeartbeat {
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateConfig {
        config: Box<AgentConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    Register {
        epoch: u64,
        result: Result<RegistryResponse>,
    },
    Heartbeat {
        epoch: u64,
        result: Result<RegistryResponse>,
    },
}

/// Run a registry call with the request timeout as a hard upper bound.
async fn bounded<F>(call: F) -> Result<RegistryResponse>
where
    F: Future<Output = Result<RegistryResponse>>,
{
    match tokio::time::timeout(NetworkConfig::REQUEST_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => Err(BeaconError::network(
            NetworkErrorKind::Connection,
            format!(
                "No response from registry within {:?}",
                NetworkConfig::REQUEST_TIMEOUT
            ),
        )),
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub(crate) struct ControllerActor {
    config: AgentConfig,
    registry: Arc<dyn RegistryApi>,
    session: Arc<dyn SessionStore>,
    /// Session as read at startup, updated as the controller writes it.
    saved_session: SessionState,

    state: ControllerState,
    instance: Option<Instance>,
    stats: HeartbeatStats,
    last_error: Option<String>,
    listener: Option<CommandListener>,

    epoch: u64,
    pending_init: Option<InitReply>,
    next_heartbeat: Option<Instant>,
    heartbeat_in_flight: bool,
    reconnect_at: Option<Instant>,

    inbound_tx: mpsc::Sender<InboundRequest>,
    inbound_rx: mpsc::Receiver<InboundRequest>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Sender<ControllerEvent>,
    snapshot: watch::Sender<ControllerSnapshot>,
}

impl ControllerActor {
    pub(crate) fn new(
        config: AgentConfig,
        registry: Arc<dyn RegistryApi>,
        session: Arc<dyn SessionStore>,
        events: broadcast::Sender<ControllerEvent>,
        snapshot: watch::Sender<ControllerSnapshot>,
    ) -> Self {
        let saved_session = SessionState::load(session.as_ref());
        if saved_session.connected {
            debug!(
                "Previous session was connected as {:?}",
                saved_session.instance_id
            );
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(ListenerConfig::QUEUE_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        Self {
            config,
            registry,
            session,
            saved_session,
            state: ControllerState::Uninitialized,
            instance: None,
            stats: HeartbeatStats::default(),
            last_error: None,
            listener: None,
            epoch: 0,
            pending_init: None,
            next_heartbeat: None,
            heartbeat_in_flight: false,
            reconnect_at: None,
            inbound_tx,
            inbound_rx,
            completion_tx,
            completion_rx,
            events,
            snapshot,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.publish();

        loop {
            let heartbeat_at = self.heartbeat_deadline();
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All controller handles dropped, tearing down");
                        self.teardown().await;
                        break;
                    }
                },
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                Some(request) = self.inbound_rx.recv() => self.handle_inbound(request),
                _ = sleep_until_opt(heartbeat_at) => self.send_heartbeat(),
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    info!("Reconnect backoff elapsed, re-initializing");
                    self.begin_initialize(None).await;
                }
            }

            self.publish();
        }

        self.publish();
        debug!("Controller task exited");
    }

    // ========================================
    // Bookkeeping
    // ========================================

    fn publish(&self) {
        self.snapshot.send_replace(ControllerSnapshot {
            state: self.state,
            instance: self.instance.clone(),
            stats: self.stats,
            last_error: self.last_error.clone(),
            listener_port: self.listener.as_ref().and_then(CommandListener::port),
            server_url: self.config.server_url(),
        });
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, to: ControllerState) {
        if to == self.state {
            return;
        }
        let from = self.state;
        self.state = to;
        info!("Controller state: {} -> {}", from, to);
        self.publish();
        self.emit(ControllerEvent::StateChanged { from, to });
    }

    /// Record a setup failure, move to `Failed` and resolve the waiting caller.
    fn fail(&mut self, err: BeaconError) {
        let message = err.to_string();
        error!("Initialization failed: {}", message);
        self.last_error = Some(message.clone());
        self.set_state(ControllerState::Failed);
        self.emit(ControllerEvent::Error { message });
        if let Some(reply) = self.pending_init.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn heartbeat_deadline(&self) -> Option<Instant> {
        if self.state == ControllerState::Heartbeating && !self.heartbeat_in_flight {
            self.next_heartbeat
        } else {
            None
        }
    }

    /// Invalidate in-flight calls and disarm all timers.
    fn cancel_pending_work(&mut self) {
        self.epoch += 1;
        self.next_heartbeat = None;
        self.heartbeat_in_flight = false;
        self.reconnect_at = None;
    }

    async fn stop_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || listener.stop()).await {
                warn!("Listener stop task failed: {}", e);
            }
        }
    }

    // ========================================
    // Commands
    // ========================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => self.begin_initialize(Some(reply)).await,
            Command::Unregister { reply } => {
                let result = self.unregister().await;
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                if !self.should_restore() {
                    let _ = reply.send(None);
                    return;
                }
                info!("Restoring previous session");
                let (tx, rx) = oneshot::channel();
                let _ = reply.send(Some(rx));
                self.begin_initialize(Some(tx)).await;
            }
            Command::StartHeartbeat { reply } => {
                let result = match self.state {
                    ControllerState::Registered => {
                        self.enter_heartbeating();
                        Ok(())
                    }
                    ControllerState::Heartbeating => Ok(()),
                    state => Err(BeaconError::InvalidState {
                        state: state.to_string(),
                        message: "heartbeats need a registered instance".to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::UpdateConfig { config, reply } => {
                let _ = reply.send(self.update_config(*config));
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn should_restore(&self) -> bool {
        self.state.can_initialize() && self.config.auto_restore && self.saved_session.connected
    }

    fn update_config(&mut self, mut config: AgentConfig) -> Result<()> {
        if !self.state.can_initialize() && self.state != ControllerState::Uninitialized {
            return Err(BeaconError::InvalidState {
                state: self.state.to_string(),
                message: "config can only change while idle".to_string(),
            });
        }
        config.refresh_display_name();
        self.registry
            .configure(&config.server_url(), config.api_key.as_deref());
        self.config = config;
        info!("Controller config updated ({})", self.config.server_url());
        Ok(())
    }

    // ========================================
    // Initialize flow
    // ========================================

    async fn begin_initialize(&mut self, reply: Option<InitReply>) {
        if !self.state.can_initialize() {
            debug!("Initialize rejected in state {}", self.state);
            if let Some(reply) = reply {
                let _ = reply.send(Err(BeaconError::AlreadyActive {
                    state: self.state.to_string(),
                }));
            }
            return;
        }

        self.cancel_pending_work();
        self.pending_init = reply;
        self.last_error = None;
        self.set_state(ControllerState::Initializing);

        // A failed registration or a reconnect leaves the old listener bound.
        self.stop_listener().await;

        if let Err(e) = self.config.validate() {
            self.fail(e);
            return;
        }

        self.set_state(ControllerState::FindingPort);
        let (min, max) = (self.config.min_port, self.config.max_port);
        let found = port::recommended_port(
            &self.config.project_name,
            i32::from(min),
            i32::from(max),
        )
        .or_else(|| port::find_available(i32::from(min), i32::from(max)));
        let Some(port) = found else {
            self.fail(BeaconError::PortUnavailable { min, max });
            return;
        };
        debug!("Allocated port {}", port);

        self.instance = Some(Instance::new(
            self.config.instance_id.clone(),
            self.config.display_name.clone(),
            port,
        ));

        self.set_state(ControllerState::StartingListener);
        let mut listener = CommandListener::new(self.inbound_tx.clone());
        if let Err(e) = listener.start(port) {
            self.fail(e);
            return;
        }
        self.listener = Some(listener);

        self.set_state(ControllerState::Registering);
        let registry = Arc::clone(&self.registry);
        let completions = self.completion_tx.clone();
        let epoch = self.epoch;
        let id = self.config.instance_id.clone();
        let name = self.config.display_name.clone();
        info!(
            "Registering '{}' on port {} with {}",
            name,
            port,
            self.config.server_url()
        );
        tokio::spawn(async move {
            let result = bounded(registry.register(&id, &name, port)).await;
            let _ = completions.send(Completion::Register { epoch, result });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Register { epoch, result } => {
                if epoch == self.epoch && self.state == ControllerState::Registering {
                    self.on_register(result);
                } else {
                    debug!("Ignoring stale register completion");
                }
            }
            Completion::Heartbeat { epoch, result } => {
                if epoch == self.epoch {
                    self.on_heartbeat(result);
                } else {
                    debug!("Ignoring stale heartbeat completion");
                }
            }
        }
    }

    fn on_register(&mut self, result: Result<RegistryResponse>) {
        let response = match result {
            Ok(response) if response.success => response,
            Ok(response) => {
                let message = if response.message.is_empty() {
                    "unknown error".to_string()
                } else {
                    response.message
                };
                self.fail(BeaconError::RegistrationRejected { message });
                return;
            }
            // A non-2xx answer is the registry refusing us; its body is the reason.
            Err(BeaconError::Network {
                kind: NetworkErrorKind::Protocol,
                message,
            }) => {
                self.fail(BeaconError::RegistrationRejected { message });
                return;
            }
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let now = now_millis();
        let Some(instance) = self.instance.as_mut() else {
            self.fail(BeaconError::RegistrationRejected {
                message: "instance record missing".to_string(),
            });
            return;
        };
        if let Some(assigned) = response.instance_id.filter(|id| !id.is_empty()) {
            if assigned != instance.id {
                info!("Registry assigned instance id {}", assigned);
                instance.id = assigned;
            }
        }
        instance.registered_at_ms = Some(now);
        instance.last_heartbeat_ms = Some(now);
        let (instance_id, port) = (instance.id.clone(), instance.port);

        self.stats.consecutive_failures = 0;
        self.set_state(ControllerState::Registered);
        info!("Registered as {} on port {}", instance_id, port);
        self.emit(ControllerEvent::Registered {
            instance_id: instance_id.clone(),
            port,
        });

        let session = SessionState {
            connected: true,
            instance_id: Some(instance_id),
            server_url: Some(self.config.server_url()),
        };
        if let Err(e) = session.save(self.session.as_ref()) {
            warn!("Failed to persist session state: {}", e);
        }
        self.saved_session = session;

        if self.config.auto_register {
            self.enter_heartbeating();
        }

        if let Some(reply) = self.pending_init.take() {
            let _ = reply.send(Ok(()));
        }
    }

    // ========================================
    // Heartbeat loop
    // ========================================

    fn enter_heartbeating(&mut self) {
        self.stats.consecutive_failures = 0;
        self.heartbeat_in_flight = false;
        self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_interval());
        self.set_state(ControllerState::Heartbeating);
    }

    fn send_heartbeat(&mut self) {
        self.next_heartbeat = None;
        if self.state != ControllerState::Heartbeating {
            return;
        }
        let Some(id) = self.instance.as_ref().map(|i| i.id.clone()) else {
            return;
        };

        self.heartbeat_in_flight = true;
        let registry = Arc::clone(&self.registry);
        let completions = self.completion_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = bounded(registry.heartbeat(&id)).await;
            let _ = completions.send(Completion::Heartbeat { epoch, result });
        });
    }

    fn on_heartbeat(&mut self, result: Result<RegistryResponse>) {
        self.heartbeat_in_flight = false;
        if self.state != ControllerState::Heartbeating {
            return;
        }

        let result = result.and_then(|response| {
            if response.success {
                Ok(response)
            } else {
                Err(BeaconError::Network {
                    kind: NetworkErrorKind::Protocol,
                    message: if response.message.is_empty() {
                        "heartbeat rejected by registry".to_string()
                    } else {
                        response.message
                    },
                })
            }
        });

        match result {
            Ok(_) => {
                let now = now_millis();
                self.stats.successes += 1;
                self.stats.consecutive_failures = 0;
                self.stats.last_success_ms = Some(now);
                if let Some(instance) = self.instance.as_mut() {
                    instance.last_heartbeat_ms = Some(now);
                }
                if self.config.verbose_logging {
                    info!("Heartbeat #{} ok", self.stats.successes);
                } else {
                    debug!("Heartbeat #{} ok", self.stats.successes);
                }
                self.emit(ControllerEvent::HeartbeatSucceeded {
                    count: self.stats.successes,
                    timestamp_ms: now,
                });
            }
            Err(e) => {
                let message = e.to_string();
                self.stats.failures += 1;
                self.stats.consecutive_failures += 1;
                self.last_error = Some(message.clone());
                warn!(
                    "Heartbeat failed ({}/{}): {}",
                    self.stats.consecutive_failures,
                    HeartbeatConfig::FAILURE_THRESHOLD,
                    message
                );
                self.emit(ControllerEvent::HeartbeatFailed {
                    consecutive: self.stats.consecutive_failures,
                    error: message,
                });

                if self.stats.consecutive_failures >= HeartbeatConfig::FAILURE_THRESHOLD {
                    self.start_reconnect();
                    return;
                }
            }
        }

        self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_interval());
    }

    fn start_reconnect(&mut self) {
        let streak = BeaconError::HeartbeatStreak {
            failures: self.stats.consecutive_failures,
        };
        warn!(
            "{}, reconnecting in {:?}",
            streak,
            HeartbeatConfig::RECONNECT_BACKOFF
        );
        self.last_error = Some(streak.to_string());

        self.set_state(ControllerState::Disconnected);
        self.cancel_pending_work();
        self.reconnect_at = Some(Instant::now() + HeartbeatConfig::RECONNECT_BACKOFF);
        self.emit(ControllerEvent::Reconnecting {
            backoff: HeartbeatConfig::RECONNECT_BACKOFF,
        });
    }

    // ========================================
    // Inbound requests
    // ========================================

    fn handle_inbound(&mut self, request: InboundRequest) {
        debug!(
            "Inbound {} {} ({} bytes)",
            request.method,
            request.path,
            request.body.len()
        );
        self.emit(ControllerEvent::RequestReceived(request));
    }

    // ========================================
    // Unregister / teardown
    // ========================================

    async fn unregister(&mut self) -> Result<()> {
        if self.state == ControllerState::Unregistering {
            return Err(BeaconError::InvalidState {
                state: self.state.to_string(),
                message: "already unregistering".to_string(),
            });
        }

        self.cancel_pending_work();
        if let Some(reply) = self.pending_init.take() {
            let _ = reply.send(Err(BeaconError::InvalidState {
                state: self.state.to_string(),
                message: "initialization cancelled by unregister".to_string(),
            }));
        }
        self.set_state(ControllerState::Unregistering);

        let registered = self
            .instance
            .as_ref()
            .filter(|i| i.is_registered())
            .map(|i| i.id.clone());
        if let Some(id) = registered {
            match bounded(self.registry.unregister(&id)).await {
                Ok(response) if response.success => info!("Unregistered {} from registry", id),
                Ok(response) => warn!(
                    "Registry refused to unregister {}: {} (continuing cleanup)",
                    id, response.message
                ),
                Err(e) => {
                    let err = BeaconError::Unregister {
                        message: e.to_string(),
                    };
                    warn!("{} (continuing cleanup)", err);
                }
            }
        }

        self.stop_listener().await;

        if let Err(e) = SessionState::clear(self.session.as_ref()) {
            warn!("Failed to clear session state: {}", e);
        }
        self.saved_session = SessionState::default();

        if let Some(instance) = self.instance.as_mut() {
            instance.registered_at_ms = None;
        }
        self.set_state(ControllerState::Unregistered);
        self.emit(ControllerEvent::Unregistered);
        Ok(())
    }

    async fn teardown(&mut self) {
        match self.state {
            ControllerState::Uninitialized | ControllerState::Unregistered => {
                self.cancel_pending_work();
                self.stop_listener().await;
            }
            _ => {
                let _ = self.unregister().await;
            }
        }
        self.instance = None;
    }
}
