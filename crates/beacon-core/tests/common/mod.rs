//! Shared test doubles: an in-memory scripted registry and an axum mock
//! registry server.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use beacon_core::error::NetworkErrorKind;
use beacon_core::{
    AgentConfig, BeaconError, HealthResponse, RegistryApi, RegistryResponse, Result,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Config pointing at `port_range`, with a project name unique to the test so
/// parallel tests don't fight over recommended ports.
pub fn test_config(project: &str, min_port: u16, max_port: u16) -> AgentConfig {
    AgentConfig {
        project_name: project.to_string(),
        min_port,
        max_port,
        heartbeat_interval_ms: 1_000,
        ..AgentConfig::default()
    }
}

/// Registry double whose answers are flipped with flags.
#[derive(Default)]
pub struct ScriptedRegistry {
    pub register_fails: AtomicBool,
    /// When set, register answers `success: false` with this message.
    pub register_rejects: Mutex<Option<String>>,
    pub heartbeat_fails: AtomicBool,
    pub unregister_fails: AtomicBool,
    /// Delay before register answers, in milliseconds.
    pub register_delay_ms: AtomicU64,
    pub assigned_id: Mutex<Option<String>>,
    pub registers: AtomicU32,
    pub heartbeats: AtomicU32,
    pub unregisters: AtomicU32,
}

impl ScriptedRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn refused(call: &str) -> BeaconError {
        BeaconError::network(
            NetworkErrorKind::Connection,
            format!("{} refused by scripted registry", call),
        )
    }

    fn ok() -> RegistryResponse {
        RegistryResponse {
            success: true,
            message: "ok".to_string(),
            instance_id: None,
        }
    }
}

#[async_trait]
impl RegistryApi for ScriptedRegistry {
    async fn register(&self, _id: &str, _name: &str, _port: u16) -> Result<RegistryResponse> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        let delay = self.register_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.register_fails.load(Ordering::SeqCst) {
            return Err(Self::refused("register"));
        }
        if let Some(message) = self.register_rejects.lock().unwrap().clone() {
            return Ok(RegistryResponse {
                success: false,
                message,
                instance_id: None,
            });
        }
        Ok(RegistryResponse {
            instance_id: self.assigned_id.lock().unwrap().clone(),
            ..Self::ok()
        })
    }

    async fn heartbeat(&self, _id: &str) -> Result<RegistryResponse> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.heartbeat_fails.load(Ordering::SeqCst) {
            return Err(Self::refused("heartbeat"));
        }
        Ok(Self::ok())
    }

    async fn unregister(&self, _id: &str) -> Result<RegistryResponse> {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        if self.unregister_fails.load(Ordering::SeqCst) {
            return Err(Self::refused("unregister"));
        }
        Ok(Self::ok())
    }

    async fn health(&self) -> Result<HealthResponse> {
        Ok(HealthResponse {
            success: true,
            status: "ok".to_string(),
            ..HealthResponse::default()
        })
    }
}

/// What the mock registry server has seen.
#[derive(Default)]
pub struct MockRegistryState {
    /// `(path, body)` of every POST, in order.
    pub calls: Mutex<Vec<(String, Value)>>,
    /// Last `X-API-Key` header value seen.
    pub api_key: Mutex<Option<String>>,
    /// Ids that `/register` rejects with 409.
    pub duplicate_ids: Mutex<Vec<String>>,
    /// Ids that `/register` answers with 200 and `success: false`.
    pub refused_ids: Mutex<Vec<String>>,
    /// When set, every endpoint answers 200 with a non-JSON body.
    pub garbage: AtomicBool,
}

impl MockRegistryState {
    pub fn paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn record(&self, path: &str, headers: &HeaderMap, body: Value) {
        if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            *self.api_key.lock().unwrap() = Some(key.to_string());
        }
        self.calls.lock().unwrap().push((path.to_string(), body));
    }
}

type Reply = (StatusCode, String);

fn reply(state: &MockRegistryState, status: StatusCode, body: Value) -> Reply {
    if state.garbage.load(Ordering::SeqCst) {
        return (StatusCode::OK, "<html>not json</html>".to_string());
    }
    (status, body.to_string())
}

async fn handle_register(
    State(state): State<Arc<MockRegistryState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    state.record("/register", &headers, body.clone());
    let id = body["id"].as_str().unwrap_or_default().to_string();
    if state.duplicate_ids.lock().unwrap().contains(&id) {
        return reply(
            &state,
            StatusCode::CONFLICT,
            json!({"success": false, "message": "duplicate id"}),
        );
    }
    if state.refused_ids.lock().unwrap().contains(&id) {
        return reply(
            &state,
            StatusCode::OK,
            json!({"success": false, "message": "duplicate id"}),
        );
    }
    reply(
        &state,
        StatusCode::OK,
        json!({"success": true, "message": "registered", "instanceId": id}),
    )
}

async fn handle_heartbeat(
    State(state): State<Arc<MockRegistryState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    state.record("/heartbeat", &headers, body);
    reply(&state, StatusCode::OK, json!({"success": true, "message": "ok"}))
}

async fn handle_unregister(
    State(state): State<Arc<MockRegistryState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    state.record("/unregister", &headers, body);
    reply(&state, StatusCode::OK, json!({"success": true, "message": "bye"}))
}

async fn handle_health(State(state): State<Arc<MockRegistryState>>) -> Reply {
    let registered = state
        .paths()
        .iter()
        .filter(|path| path.as_str() == "/register")
        .count();
    reply(
        &state,
        StatusCode::OK,
        json!({
            "status": "ok",
            "uptime": 42.5,
            "instances": {"total": registered, "online": registered, "offline": 0}
        }),
    )
}

/// Start a mock registry on an ephemeral loopback port.
pub async fn start_mock_registry() -> (SocketAddr, Arc<MockRegistryState>) {
    let state = Arc::new(MockRegistryState::default());
    let app = Router::new()
        .route("/register", post(handle_register))
        .route("/heartbeat", post(handle_heartbeat))
        .route("/unregister", post(handle_unregister))
        .route("/health", get(handle_health))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}
