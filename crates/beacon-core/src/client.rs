//! HTTP client for the remote registry service.
//!
//! Four operations, each a single round trip bounded by
//! [`NetworkConfig::REQUEST_TIMEOUT`]:
//!
//! | Operation | Request |
//! |---|---|
//! | register | `POST /register {id, name, port}` |
//! | heartbeat | `POST /heartbeat {id}` |
//! | unregister | `POST /unregister {id}` |
//! | health | `GET /health` |
//!
//! A 2xx response is a success unless its payload explicitly says
//! `"success": false`, in which case the payload's message is the remote's
//! reason. Non-2xx responses are [`NetworkErrorKind::Protocol`] errors.

use crate::config::{AgentConfig, NetworkConfig};
use crate::error::NetworkErrorKind;
use crate::{BeaconError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::debug;

/// Outcome of a register, heartbeat or unregister call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryResponse {
    pub success: bool,
    pub message: String,
    /// Server-assigned instance id (register only).
    pub instance_id: Option<String>,
}

/// Instance counts reported by `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceCounts {
    pub total: u32,
    pub online: u32,
    pub offline: u32,
}

/// Outcome of a health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub status: String,
    /// Registry uptime in seconds.
    pub uptime: Option<f64>,
    pub instances: InstanceCounts,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RegistryPayload {
    success: Option<bool>,
    message: Option<String>,
    instance_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HealthPayload {
    status: Option<String>,
    uptime: Option<f64>,
    instances: InstanceCounts,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    id: &'a str,
    name: &'a str,
    port: u16,
}

#[derive(Debug, Serialize)]
struct InstanceRequest<'a> {
    id: &'a str,
}

/// Registry operations used by the controller.
///
/// Implemented by [`RegistryClient`]; tests and alternative transports can
/// supply their own.
#[async_trait]
pub trait RegistryApi: Send + Sync + 'static {
    async fn register(&self, id: &str, name: &str, port: u16) -> Result<RegistryResponse>;

    async fn heartbeat(&self, id: &str) -> Result<RegistryResponse>;

    async fn unregister(&self, id: &str) -> Result<RegistryResponse>;

    async fn health(&self) -> Result<HealthResponse>;

    /// Point the client at a new registry. Called when the config changes.
    fn configure(&self, _server_url: &str, _api_key: Option<&str>) {}
}

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    api_key: Option<String>,
}

/// reqwest-backed registry client.
pub struct RegistryClient {
    client: Client,
    endpoint: RwLock<Endpoint>,
}

fn net_err(kind: NetworkErrorKind, message: String) -> BeaconError {
    BeaconError::Network { kind, message }
}

impl RegistryClient {
    /// Create a client for the registry at `server_url` (e.g. `http://127.0.0.1:3000`).
    pub fn new(server_url: &str, api_key: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .timeout(NetworkConfig::REQUEST_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| {
                net_err(
                    NetworkErrorKind::Connection,
                    format!("Failed to create HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            client,
            endpoint: RwLock::new(Endpoint {
                base_url: server_url.trim_end_matches('/').to_string(),
                api_key: api_key.map(str::to_string),
            }),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::new(&config.server_url(), config.api_key.as_deref())
    }

    pub fn base_url(&self) -> String {
        self.endpoint().base_url
    }

    fn endpoint(&self) -> Endpoint {
        match self.endpoint.read() {
            Ok(endpoint) => endpoint.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Send a request and return the body of a 2xx response.
    async fn execute(&self, request: RequestBuilder, url: &str, api_key: Option<&str>) -> Result<String> {
        let request = match api_key {
            Some(key) => request.header(NetworkConfig::API_KEY_HEADER, key),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            net_err(
                NetworkErrorKind::Connection,
                format!("Failed to reach registry at {}: {}", url, e),
            )
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            net_err(
                NetworkErrorKind::Connection,
                format!("Failed to read response from {}: {}", url, e),
            )
        })?;

        if !status.is_success() {
            return Err(net_err(
                NetworkErrorKind::Protocol,
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        debug!("{} -> {}", url, status);
        Ok(body)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<RegistryResponse> {
        let endpoint = self.endpoint();
        let url = format!("{}{}", endpoint.base_url, path);
        let request = self.client.post(&url).json(body);
        let text = self
            .execute(request, &url, endpoint.api_key.as_deref())
            .await?;
        parse_registry_payload(&text)
    }
}

/// Merge a 2xx payload into a response. The payload may only veto success.
fn parse_registry_payload(text: &str) -> Result<RegistryResponse> {
    let payload: RegistryPayload = if text.trim().is_empty() {
        RegistryPayload::default()
    } else {
        serde_json::from_str(text).map_err(|e| {
            net_err(
                NetworkErrorKind::Parse,
                format!("Failed to parse registry response: {}", e),
            )
        })?
    };

    Ok(RegistryResponse {
        success: payload.success.unwrap_or(true),
        message: payload.message.unwrap_or_default(),
        instance_id: payload.instance_id,
    })
}

fn parse_health_payload(text: &str) -> Result<HealthResponse> {
    let payload: HealthPayload = serde_json::from_str(text).map_err(|e| {
        net_err(
            NetworkErrorKind::Parse,
            format!("Failed to parse health response: {}", e),
        )
    })?;

    Ok(HealthResponse {
        success: true,
        status: payload.status.unwrap_or_default(),
        uptime: payload.uptime,
        instances: payload.instances,
    })
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn register(&self, id: &str, name: &str, port: u16) -> Result<RegistryResponse> {
        self.post("/register", &RegisterRequest { id, name, port })
            .await
    }

    async fn heartbeat(&self, id: &str) -> Result<RegistryResponse> {
        self.post("/heartbeat", &InstanceRequest { id }).await
    }

    async fn unregister(&self, id: &str) -> Result<RegistryResponse> {
        self.post("/unregister", &InstanceRequest { id }).await
    }

    async fn health(&self) -> Result<HealthResponse> {
        let endpoint = self.endpoint();
        let url = format!("{}/health", endpoint.base_url);
        let request = self.client.get(&url);
        let text = self
            .execute(request, &url, endpoint.api_key.as_deref())
            .await?;
        parse_health_payload(&text)
    }

    fn configure(&self, server_url: &str, api_key: Option<&str>) {
        let endpoint = Endpoint {
            base_url: server_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
        };
        match self.endpoint.write() {
            Ok(mut current) => *current = endpoint,
            Err(poisoned) => *poisoned.into_inner() = endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_without_success_field_is_success() {
        let response =
            parse_registry_payload(r#"{"message":"ok","instanceId":"abc"}"#).unwrap();
        assert!(response.success);
        assert_eq!(response.message, "ok");
        assert_eq!(response.instance_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_payload_can_report_failure() {
        let response =
            parse_registry_payload(r#"{"success":false,"message":"duplicate id"}"#).unwrap();
        assert!(!response.success);
        assert_eq!(response.message, "duplicate id");
        assert!(response.instance_id.is_none());
    }

    #[test]
    fn test_empty_payload_is_success() {
        let response = parse_registry_payload("").unwrap();
        assert!(response.success);
        assert!(response.message.is_empty());
        assert!(response.instance_id.is_none());
    }

    #[test]
    fn test_malformed_payload_is_parse_error() {
        let err = parse_registry_payload("<html>").unwrap_err();
        assert_eq!(err.network_kind(), Some(NetworkErrorKind::Parse));
    }

    #[test]
    fn test_health_payload() {
        let health = parse_health_payload(
            r#"{"status":"ok","uptime":12.5,"instances":{"total":3,"online":2,"offline":1}}"#,
        )
        .unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.uptime, Some(12.5));
        assert_eq!(
            health.instances,
            InstanceCounts {
                total: 3,
                online: 2,
                offline: 1
            }
        );
    }

    #[test]
    fn test_configure_replaces_endpoint() {
        let client = RegistryClient::new("http://127.0.0.1:3000/", None).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:3000");

        client.configure("http://registry.local:4000", Some("key"));
        assert_eq!(client.base_url(), "http://registry.local:4000");
        assert_eq!(client.endpoint().api_key.as_deref(), Some("key"));
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_connection_error() {
        // Bind then release a port so nothing is listening on it.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = RegistryClient::new(&format!("http://127.0.0.1:{}", port), None).unwrap();

        let err = client.heartbeat("abc").await.unwrap_err();
        assert_eq!(err.network_kind(), Some(NetworkErrorKind::Connection));
    }
}
