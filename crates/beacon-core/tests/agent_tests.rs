//! End-to-end tests: controller, real registry client, mock registry server.

mod common;

use beacon_core::session::SessionState;
use beacon_core::{
    AgentConfig, AgentController, BeaconError, ControllerEvent, ControllerState,
    JsonSessionStore, MemorySessionStore, NetworkErrorKind, RegistryClient,
};
use common::{start_mock_registry, test_config};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config_for(registry: SocketAddr, project: &str, min_port: u16, max_port: u16) -> AgentConfig {
    AgentConfig {
        server_host: registry.ip().to_string(),
        server_port: registry.port(),
        api_key: Some("test-key".to_string()),
        ..test_config(project, min_port, max_port)
    }
}

fn spawn_controller(config: AgentConfig) -> AgentController {
    let registry = Arc::new(RegistryClient::from_config(&config).unwrap());
    AgentController::spawn(config, registry, Arc::new(MemorySessionStore::new()))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_lifecycle_against_registry() {
    let (addr, state) = start_mock_registry().await;
    let config = config_for(addr, "lifecycle", 23000, 23099);
    let instance_id = config.instance_id.clone();
    let controller = spawn_controller(config);
    let mut events = controller.subscribe();

    controller.initialize().await.unwrap();
    assert_eq!(controller.state(), ControllerState::Heartbeating);

    // Wait for one heartbeat to reach the registry.
    let beat = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let ControllerEvent::HeartbeatSucceeded { count, .. } = events.recv().await.unwrap() {
                return count;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(beat, 1);

    controller.unregister().await.unwrap();
    assert_eq!(controller.state(), ControllerState::Unregistered);

    let paths = state.paths();
    assert_eq!(paths.first().map(String::as_str), Some("/register"));
    assert!(paths.contains(&"/heartbeat".to_string()));
    assert_eq!(paths.last().map(String::as_str), Some("/unregister"));
    assert_eq!(state.api_key.lock().unwrap().as_deref(), Some("test-key"));

    let calls = state.calls.lock().unwrap();
    assert_eq!(calls[0].1["id"], instance_id.as_str());
    assert!(calls[0].1["name"].as_str().unwrap().starts_with("lifecycle@"));
    drop(calls);

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_id_fails_with_remote_message() {
    let (addr, state) = start_mock_registry().await;
    let config = config_for(addr, "duplicate", 23100, 23199);
    state
        .duplicate_ids
        .lock()
        .unwrap()
        .push(config.instance_id.clone());
    let controller = spawn_controller(config);

    let err = controller.initialize().await.unwrap_err();
    match err {
        BeaconError::RegistrationRejected { message } => {
            assert!(message.contains("duplicate id"), "{}", message)
        }
        other => panic!("Expected RegistrationRejected, got {:?}", other),
    }
    assert_eq!(controller.state(), ControllerState::Failed);
    assert!(controller.last_error().unwrap().contains("duplicate id"));

    controller.shutdown().await;
    // Never registered, so nothing to unregister.
    assert!(!state.paths().contains(&"/unregister".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refusal_in_ok_payload_fails_initialize() {
    let (addr, state) = start_mock_registry().await;
    let config = config_for(addr, "refused", 23600, 23699);
    state
        .refused_ids
        .lock()
        .unwrap()
        .push(config.instance_id.clone());
    let controller = spawn_controller(config);

    match controller.initialize().await {
        Err(BeaconError::RegistrationRejected { message }) => assert_eq!(message, "duplicate id"),
        other => panic!("Expected RegistrationRejected, got {:?}", other),
    }
    assert_eq!(controller.state(), ControllerState::Failed);
    assert!(controller.last_error().unwrap().contains("duplicate id"));
    assert!(!state.paths().contains(&"/heartbeat".to_string()));

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_registry_fails_initialize() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = config_for(
        SocketAddr::from(([127, 0, 0, 1], port)),
        "unreachable",
        23200,
        23299,
    );
    let controller = spawn_controller(config);

    let err = controller.initialize().await.unwrap_err();
    assert_eq!(err.network_kind(), Some(NetworkErrorKind::Connection));
    assert_eq!(controller.state(), ControllerState::Failed);
    assert!(controller.health_check().await.is_err());

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inbound_request_is_acknowledged_and_forwarded() {
    let (addr, _state) = start_mock_registry().await;
    let controller = spawn_controller(config_for(addr, "inbound", 23300, 23399));
    let mut events = controller.subscribe();
    controller.initialize().await.unwrap();
    let port = controller.instance().unwrap().port;

    let response = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"POST /command HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"action\":\"ping\"}")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    })
    .await
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains(r#"{"success":true,"message":"Request received"}"#));

    let request = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ControllerEvent::RequestReceived(request) = events.recv().await.unwrap() {
                return request;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/command");
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.json_body().unwrap()["action"], "ping");

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_file_written_and_cleared() {
    let (addr, _state) = start_mock_registry().await;
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("session.json");
    let config = config_for(addr, "session", 23400, 23499);
    let registry = Arc::new(RegistryClient::from_config(&config).unwrap());
    let session = Arc::new(JsonSessionStore::open(&path).unwrap());
    let controller = AgentController::spawn(config, registry, session);

    controller.initialize().await.unwrap();
    let saved = SessionState::load(&JsonSessionStore::open(&path).unwrap());
    assert!(saved.connected);
    assert_eq!(saved.server_url, Some(format!("http://{}", addr)));

    controller.unregister().await.unwrap();
    assert!(!path.exists());

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_restores_from_session_file() {
    let (addr, state) = start_mock_registry().await;
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("session.json");
    let config = config_for(addr, "restart", 23500, 23599);

    // A previous run left a connected session behind.
    SessionState {
        connected: true,
        instance_id: Some(config.instance_id.clone()),
        server_url: Some(config.server_url()),
    }
    .save(&JsonSessionStore::open(&path).unwrap())
    .unwrap();

    let registry = Arc::new(RegistryClient::from_config(&config).unwrap());
    let session = Arc::new(JsonSessionStore::open(&path).unwrap());
    let controller = AgentController::spawn(config, registry, session);
    assert!(controller.resume().await.unwrap());
    assert!(controller.state().is_connected());
    assert_eq!(state.paths().first().map(String::as_str), Some("/register"));

    controller.shutdown().await;
    assert!(!path.exists());
}
