//! Shared test infrastructure: a request-recording mock upstream and a
//! helper that spawns the proxy binary against it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;

// ============================================================================
// Mock Upstream
// ============================================================================

/// One request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    /// All values of a query parameter, in order.
    pub fn query_values(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn has_query_key(&self, key: &str) -> bool {
        self.query.iter().any(|(k, _)| k == key)
    }

    /// Decode the body as form parameters.
    pub fn form(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .into_owned()
            .collect()
    }
}

#[derive(Clone, Default)]
struct UpstreamState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// The single request received, failing if there were zero or many.
    pub fn only_request(&self) -> CapturedRequest {
        let requests = self.requests();
        assert_eq!(requests.len(), 1, "expected exactly one upstream request, got {requests:?}");
        requests.into_iter().next().unwrap()
    }
}

/// Spawn a mock Prometheus/Alertmanager upstream that records every request
/// and serves canned payloads for the listing endpoints.
pub async fn spawn_upstream() -> MockUpstream {
    let state = UpstreamState::default();
    let requests = state.requests.clone();

    let app = Router::new().fallback(capture).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });

    MockUpstream {
        addr,
        requests,
        _handle: handle,
    }
}

async fn capture(State(state): State<UpstreamState>, req: Request) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query: Vec<(String, String)> =
        url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
            .into_owned()
            .collect();
    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let body = String::from_utf8_lossy(&body_bytes).to_string();

    state.requests.lock().unwrap().push(CapturedRequest {
        method: method.clone(),
        path: path.clone(),
        query,
        body,
    });

    respond(&method, &path)
}

fn respond(method: &str, path: &str) -> Response {
    let json_headers = [("content-type", "application/json")];
    match (method, path.trim_end_matches('/')) {
        (_, "/api/v1/rules") => (StatusCode::OK, json_headers, rules_fixture()).into_response(),
        (_, "/api/v1/alerts") => (StatusCode::OK, json_headers, alerts_fixture()).into_response(),
        ("GET", "/api/v2/silence/s-owned") => {
            (StatusCode::OK, json_headers, silence_fixture("s-owned", "a")).into_response()
        }
        ("GET", "/api/v2/silence/s-cross") => {
            (StatusCode::OK, json_headers, silence_fixture("s-cross", "b")).into_response()
        }
        ("GET", "/api/v2/silence/s-missing") => (
            StatusCode::NOT_FOUND,
            json_headers,
            r#"{"message":"silence not found"}"#.to_string(),
        )
            .into_response(),
        ("DELETE", _) => (StatusCode::OK, json_headers, "{}".to_string()).into_response(),
        _ => (
            StatusCode::OK,
            json_headers,
            json!({"status": "success", "data": {}}).to_string(),
        )
            .into_response(),
    }
}

fn rules_fixture() -> String {
    json!({
        "status": "success",
        "data": {
            "groups": [
                {
                    "name": "team-a.rules",
                    "file": "/etc/prometheus/a.yaml",
                    "rules": [
                        {
                            "name": "TenantAHighErrors",
                            "query": "errors > 1",
                            "labels": {"tenant": "a", "severity": "page"},
                            "health": "ok",
                            "type": "alerting",
                            "alerts": [
                                {"labels": {"tenant": "a", "alertname": "TenantAHighErrors"}, "state": "firing"}
                            ]
                        }
                    ]
                },
                {
                    "name": "team-b.rules",
                    "file": "/etc/prometheus/b.yaml",
                    "rules": [
                        {
                            "name": "TenantBRecording",
                            "query": "up == 0",
                            "labels": {"tenant": "b"},
                            "health": "ok",
                            "type": "recording"
                        }
                    ]
                }
            ]
        }
    })
    .to_string()
}

fn alerts_fixture() -> String {
    json!({
        "status": "success",
        "data": {
            "alerts": [
                {"labels": {"tenant": "a", "alertname": "TenantAHighErrors"}, "state": "firing"},
                {"labels": {"tenant": "b", "alertname": "TenantBDown"}, "state": "firing"}
            ]
        }
    })
    .to_string()
}

fn silence_fixture(id: &str, tenant: &str) -> String {
    json!({
        "id": id,
        "status": {"state": "active"},
        "matchers": [
            {"name": "alertname", "value": "Down", "isRegex": false, "isEqual": true},
            {"name": "tenant", "value": tenant, "isRegex": false, "isEqual": true}
        ],
        "startsAt": "2026-01-01T00:00:00Z",
        "endsAt": "2026-01-02T00:00:00Z",
        "createdBy": "ops",
        "comment": "maintenance"
    })
    .to_string()
}

// ============================================================================
// Proxy Spawning
// ============================================================================

/// Configuration for spawning the proxy binary.
///
/// Use struct update syntax with `Default` for concise test setup:
/// ```ignore
/// ProxySpec { static_value: Some("a"), ..Default::default() }
/// ```
pub struct ProxySpec {
    pub label: &'static str,
    pub static_value: Option<&'static str>,
    pub error_on_replace: bool,
    pub enable_label_apis: bool,
    pub passthrough_paths: Vec<&'static str>,
}

impl Default for ProxySpec {
    fn default() -> Self {
        Self {
            label: "tenant",
            static_value: None,
            error_on_replace: false,
            enable_label_apis: false,
            passthrough_paths: Vec::new(),
        }
    }
}

impl ProxySpec {
    fn to_toml(&self, listen_port: u16, upstream: SocketAddr) -> String {
        let mut toml = format!(
            r#"[proxy]
listen = "127.0.0.1:{listen_port}"
upstream = "http://{upstream}"

[tenant]
label = "{}"
"#,
            self.label
        );
        if let Some(value) = self.static_value {
            toml.push_str(&format!("value = \"{value}\"\n"));
        }
        if self.error_on_replace {
            toml.push_str("error_on_replace = true\n");
        }
        if self.enable_label_apis {
            toml.push_str("enable_label_apis = true\n");
        }
        if !self.passthrough_paths.is_empty() {
            let paths: Vec<String> = self
                .passthrough_paths
                .iter()
                .map(|p| format!("\"{p}\""))
                .collect();
            toml.push_str(&format!("passthrough_paths = [{}]\n", paths.join(", ")));
        }
        toml
    }
}

pub struct ProxyHandle {
    pub port: u16,
    _handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path_and_query)
    }
}

/// Spawn the proxy binary with the given spec and wait until it answers on
/// /healthz.
pub async fn spawn_proxy(spec: ProxySpec, upstream: SocketAddr, temp_dir: &TempDir) -> ProxyHandle {
    let port = find_available_port().await;
    let config_path = temp_dir.path().join("tenantproxy.toml");
    std::fs::write(&config_path, spec.to_toml(port, upstream)).expect("write config");

    let handle = tokio::spawn(async move {
        let status = tokio::process::Command::new(env!("CARGO_BIN_EXE_tenantproxy"))
            .arg("-c")
            .arg(&config_path)
            .kill_on_drop(true)
            .status()
            .await;
        // Proxy ran until killed
        let _ = status;
    });

    let health = format!("http://127.0.0.1:{port}/healthz");
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(resp) = reqwest::get(&health).await {
            if resp.status().is_success() {
                return ProxyHandle {
                    port,
                    _handle: handle,
                };
            }
        }
    }
    panic!("proxy did not become ready on port {port}");
}

/// Run the proxy binary with a config that should be refused at startup and
/// return its exit status.
pub async fn spawn_proxy_expect_exit(
    spec: ProxySpec,
    upstream: SocketAddr,
    temp_dir: &TempDir,
) -> std::process::ExitStatus {
    let port = find_available_port().await;
    let config_path = temp_dir.path().join("tenantproxy.toml");
    std::fs::write(&config_path, spec.to_toml(port, upstream)).expect("write config");

    let status = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::process::Command::new(env!("CARGO_BIN_EXE_tenantproxy"))
            .arg("-c")
            .arg(&config_path)
            .kill_on_drop(true)
            .status(),
    )
    .await
    .expect("proxy did not exit")
    .expect("spawn proxy");
    status
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Find an available port for testing
pub async fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}
