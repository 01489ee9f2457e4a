//! Beacon Agent - keeps this host registered with a Beacon registry.
//!
//! Loads the agent config, restores the previous session when there was one
//! (or registers fresh), logs controller events and unregisters on Ctrl-C.

use anyhow::{Context, Result};
use beacon_core::config::AppConfig;
use beacon_core::{
    AgentConfig, AgentController, ControllerEvent, JsonSessionStore, RegistryClient,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "beacon-agent")]
#[command(about = "Register this host with a Beacon registry and keep it alive")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registry host
    #[arg(long)]
    host: Option<String>,

    /// Registry port
    #[arg(short, long)]
    port: Option<u16>,

    /// Project name used for the display name and port selection
    #[arg(long)]
    project: Option<String>,

    /// API key sent with every registry request
    #[arg(long)]
    api_key: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Write the effective config back to the config file
    #[arg(long)]
    save: bool,
}

impl Args {
    fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(AppConfig::default_config_path)
    }

    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(host) = &self.host {
            config.server_host = host.clone();
        }
        if let Some(port) = self.port {
            config.server_port = port;
        }
        if let Some(project) = &self.project {
            config.project_name = project.clone();
        }
        if let Some(key) = &self.api_key {
            config.api_key = Some(key.clone());
        }
        if self.debug {
            config.verbose_logging = true;
        }
        config.refresh_display_name();
    }
}

/// Load the config file if it exists, otherwise start from defaults.
fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match args.config_path() {
        Some(path) => match AgentConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
        {
            Some(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            None => {
                debug!("No config at {}, using defaults", path.display());
                AgentConfig::default()
            }
        },
        None => AgentConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    if args.save {
        let path = args
            .config_path()
            .context("No config path available to save to")?;
        config
            .save(&path)
            .with_context(|| format!("Failed to save config to {}", path.display()))?;
        info!("Saved config to {}", path.display());
    }

    Ok(config)
}

/// Filter directive for the subscriber. `--debug` wins, then `RUST_LOG`,
/// then `info`.
fn log_directive(debug: bool, rust_log: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    rust_log
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn log_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::StateChanged { .. } => {}
        ControllerEvent::Registered { instance_id, port } => {
            info!("Registered as {} (listening on {})", instance_id, port)
        }
        ControllerEvent::Unregistered => info!("Unregistered"),
        ControllerEvent::HeartbeatSucceeded { count, .. } => debug!("Heartbeat #{}", count),
        ControllerEvent::HeartbeatFailed { consecutive, error } => {
            warn!("Heartbeat failure #{}: {}", consecutive, error)
        }
        ControllerEvent::Reconnecting { backoff } => info!("Reconnecting in {:?}", backoff),
        ControllerEvent::Error { message } => warn!("Controller error: {}", message),
        ControllerEvent::RequestReceived(request) => info!(
            "Received {} {} ({} bytes)",
            request.method,
            request.path,
            request.body.len()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let directive = log_directive(args.debug, std::env::var("RUST_LOG").ok());
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(directive))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Beacon agent");

    let config = load_config(&args)?;
    info!(
        "Agent '{}' ({}) using registry {}",
        config.display_name,
        config.instance_id,
        config.server_url()
    );

    let registry = Arc::new(RegistryClient::from_config(&config)?);
    let session = Arc::new(JsonSessionStore::open_default()?);
    debug!("Session file: {}", session.path().display());

    let controller = AgentController::spawn(config, registry, session);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} controller events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    match controller.health_check().await {
        Ok(health) => info!(
            "Registry is {} ({} instances online)",
            health.status, health.instances.online
        ),
        Err(e) => warn!("Registry health check failed: {}", e),
    }

    // A failed first attempt is not fatal; the agent stays up and can be
    // stopped cleanly.
    let started = match controller.resume().await {
        Ok(true) => Ok(()),
        Ok(false) => controller.initialize().await,
        Err(e) => Err(e),
    };
    if let Err(e) = started {
        warn!("Agent did not register: {}", e);
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, unregistering");
    controller.shutdown().await;

    Ok(())
}
