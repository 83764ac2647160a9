//! The proxy's single network face.
//!
//! `POST /mcp` is the MCP JSON-RPC endpoint; `/health`, `/servers`, and
//! `/status` are the management surface. The router reads the registry and
//! the published index but never mutates either, and it holds no lock
//! across an upstream call.

use crate::client::McpClient;
use crate::error::{ErrorKind, HubError};
use crate::index::IndexPublisher;
use crate::jsonrpc::{self, ErrorObject, Request, Response};
use crate::metrics::Metrics;
use crate::registry::Registry;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Slice of the remaining deadline reserved for routing overhead; each
/// upstream attempt gets the rest.
const ROUTING_BUDGET: Duration = Duration::from_millis(100);

/// Budget for fire-and-forget notification forwarding.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AppState {
    pub registry: Arc<Registry>,
    pub index: Arc<IndexPublisher>,
    pub client: Arc<McpClient>,
    pub metrics: Arc<Metrics>,
    pub request_timeout: Duration,
    pub start_time: Instant,
    /// Correlation of in-flight forwarded requests: caller id → backend.
    /// Lets `notifications/cancelled` chase a request to its backend.
    in_flight: Mutex<HashMap<String, String>>,
}

impl AppState {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        index: Arc<IndexPublisher>,
        client: Arc<McpClient>,
        metrics: Arc<Metrics>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            index,
            client,
            metrics,
            request_timeout,
            start_time: Instant::now(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

/// Build the full HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/health", get(handle_health))
        .route("/servers", get(handle_servers))
        .route("/status", get(handle_status))
        .layer(axum::middleware::from_fn(cors))
        .with_state(state)
}

/// Permissive CORS so the desktop GUI can observe the proxy directly.
async fn cors(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

// ============================================================================
// MCP endpoint
// ============================================================================

async fn handle_mcp(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_response(Response::error(
                Value::Null,
                jsonrpc::PARSE_ERROR,
                format!("parse error: {e}"),
                None,
            ));
        }
    };

    let fallback_id = raw.get("id").cloned().unwrap_or(Value::Null);
    let envelope: Request = match serde_json::from_value(raw) {
        Ok(req) => req,
        Err(e) => {
            return rpc_response(Response::error(
                fallback_id,
                jsonrpc::INVALID_REQUEST,
                format!("invalid request: {e}"),
                None,
            ));
        }
    };
    if envelope.jsonrpc != "2.0" {
        return rpc_response(Response::error(
            fallback_id,
            jsonrpc::INVALID_REQUEST,
            "invalid request: jsonrpc must be \"2.0\"",
            None,
        ));
    }

    if envelope.method.starts_with("notifications/") {
        return handle_notification(&state, &envelope).await;
    }

    let Some(id) = envelope.id.clone() else {
        return rpc_response(Response::error(
            Value::Null,
            jsonrpc::INVALID_REQUEST,
            "invalid request: non-notification without id",
            None,
        ));
    };

    let deadline = tokio::time::Instant::now() + state.request_timeout;
    let response = dispatch(&state, id, &envelope, deadline).await;
    rpc_response(response)
}

async fn dispatch(
    state: &Arc<AppState>,
    id: Value,
    envelope: &Request,
    deadline: tokio::time::Instant,
) -> Response {
    let index = state.index.load();
    match envelope.method.as_str() {
        // Answered locally: the synthesized union of all healthy backends.
        // Upstream `initialize` is reserved for the health monitor.
        "initialize" => Response::ok(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": index.capabilities,
                "serverInfo": {
                    "name": "mcp-hub",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => Response::ok(id, json!({"tools": index.tools})),
        "resources/list" => Response::ok(id, json!({"resources": index.resources})),
        "prompts/list" => Response::ok(id, json!({"prompts": index.prompts})),
        "tools/call" => {
            let Some(name) = param_str(envelope, "name") else {
                return invalid_params(id, "tool name required");
            };
            match index.resolve_tool(&name) {
                Some(backend) => {
                    let backend = backend.to_string();
                    forward_targeted(state, &backend, id, envelope, deadline).await
                }
                None => not_found(state, id, format!("tool not found: {name}")),
            }
        }
        "resources/read" => {
            let Some(uri) = param_str(envelope, "uri") else {
                return invalid_params(id, "resource uri required");
            };
            match index.resolve_resource(&uri) {
                Some(backend) => {
                    let backend = backend.to_string();
                    forward_targeted(state, &backend, id, envelope, deadline).await
                }
                None => not_found(state, id, format!("resource not found: {uri}")),
            }
        }
        "prompts/get" => {
            let Some(name) = param_str(envelope, "name") else {
                return invalid_params(id, "prompt name required");
            };
            match index.resolve_prompt(&name) {
                Some(backend) => {
                    let backend = backend.to_string();
                    forward_targeted(state, &backend, id, envelope, deadline).await
                }
                None => not_found(state, id, format!("prompt not found: {name}")),
            }
        }
        other => not_found(state, id, format!("Method not found: {other}")),
    }
}

fn param_str(envelope: &Request, key: &str) -> Option<String> {
    envelope
        .params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn invalid_params(id: Value, detail: &str) -> Response {
    Response::error(
        id,
        jsonrpc::INVALID_PARAMS,
        format!("Invalid params: {detail}"),
        None,
    )
}

fn not_found(state: &AppState, id: Value, message: String) -> Response {
    state.metrics.incr_error(ErrorKind::NotFound);
    Response::error(id, jsonrpc::METHOD_NOT_FOUND, message, None)
}

/// Forward a targeted request to its owning backend.
///
/// At most one retry, and only on transport failure; application errors
/// pass through unchanged (id rewritten); protocol violations and an
/// exhausted deadline surface as `-32603`.
async fn forward_targeted(
    state: &Arc<AppState>,
    backend_name: &str,
    id: Value,
    envelope: &Request,
    deadline: tokio::time::Instant,
) -> Response {
    let Some(backend) = state.registry.get(backend_name) else {
        // The index is rebuilt when eligibility changes, but a remove can
        // land between resolve and forward.
        state.metrics.incr_error(ErrorKind::Transport);
        return transport_error(id);
    };

    let _guard = InFlightGuard::register(state, &id, backend_name);

    let mut retried = false;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining <= ROUTING_BUDGET {
            state.metrics.incr_error(ErrorKind::Deadline);
            return deadline_error(id);
        }
        let budget = remaining - ROUTING_BUDGET;

        match state.client.forward(&backend.url, envelope, budget).await {
            Ok(upstream) => {
                if let Some(err) = upstream.error {
                    state.metrics.incr_error(ErrorKind::Application);
                    return application_error(id, err);
                }
                return Response::ok(id, upstream.result.unwrap_or(Value::Null));
            }
            Err(HubError::Transport(e)) => {
                state.metrics.incr_error(ErrorKind::Transport);
                if retried {
                    tracing::warn!(backend = backend_name, error = %e, "forward failed after retry");
                    return transport_error(id);
                }
                tracing::debug!(backend = backend_name, error = %e, "forward failed, retrying once");
                retried = true;
            }
            Err(HubError::Protocol(e)) => {
                state.metrics.incr_error(ErrorKind::Protocol);
                tracing::warn!(backend = backend_name, error = %e, "backend protocol violation");
                return Response::error(
                    id,
                    jsonrpc::INTERNAL_ERROR,
                    "internal error: backend protocol violation",
                    Some(json!({"reason": "protocol"})),
                );
            }
            Err(other) => {
                state.metrics.incr_error(other.kind());
                tracing::warn!(backend = backend_name, error = %other, "forward failed");
                return Response::error(
                    id,
                    jsonrpc::INTERNAL_ERROR,
                    "internal error",
                    Some(json!({"reason": other.kind().label()})),
                );
            }
        }
    }
}

fn transport_error(id: Value) -> Response {
    Response::error(
        id,
        jsonrpc::INTERNAL_ERROR,
        "internal error: backend transport failure",
        Some(json!({"reason": "transport"})),
    )
}

fn deadline_error(id: Value) -> Response {
    Response::error(
        id,
        jsonrpc::INTERNAL_ERROR,
        "internal error",
        Some(json!({"reason": "deadline exceeded"})),
    )
}

fn application_error(id: Value, err: ErrorObject) -> Response {
    Response {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(err),
    }
}

/// Registers a forwarded request in the correlation map for the duration of
/// the forward.
struct InFlightGuard {
    state: Arc<AppState>,
    key: String,
}

impl InFlightGuard {
    fn register(state: &Arc<AppState>, id: &Value, backend: &str) -> Self {
        let key = correlation_key(id);
        state
            .in_flight
            .lock()
            .insert(key.clone(), backend.to_string());
        Self {
            state: state.clone(),
            key,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.lock().remove(&self.key);
    }
}

fn correlation_key(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

/// Notifications carry no id and get no body back. `notifications/cancelled`
/// for a request we are currently forwarding follows that request to its
/// backend; everything else is dropped and counted.
async fn handle_notification(state: &Arc<AppState>, envelope: &Request) -> axum::response::Response {
    if envelope.method == "notifications/cancelled" {
        let target = envelope
            .params
            .as_ref()
            .and_then(|p| p.get("requestId"))
            .map(correlation_key)
            .and_then(|key| state.in_flight.lock().get(&key).cloned());

        if let Some(backend_name) = target
            && let Some(backend) = state.registry.get(&backend_name)
        {
            let client = state.client.clone();
            let metrics = state.metrics.clone();
            let notification = envelope.clone();
            tokio::spawn(async move {
                if let Err(e) = client
                    .notify(&backend.url, &notification, NOTIFY_TIMEOUT)
                    .await
                {
                    metrics.incr_error(e.kind());
                    tracing::debug!(backend = %backend.name, error = %e, "notification forward failed");
                }
            });
            return StatusCode::ACCEPTED.into_response();
        }
    }

    state.metrics.incr_dropped_notification();
    StatusCode::ACCEPTED.into_response()
}

fn rpc_response(response: Response) -> axum::response::Response {
    (StatusCode::OK, Json(response)).into_response()
}

// ============================================================================
// Management surface
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    servers: usize,
    healthy_servers: usize,
    server_list: Vec<String>,
}

/// GET /health - liveness plus a summary of the backend fleet.
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshots = state.registry.snapshot();
    let healthy: Vec<String> = snapshots
        .iter()
        .filter(|s| s.healthy)
        .map(|s| s.name.clone())
        .collect();
    Json(HealthResponse {
        status: "healthy",
        servers: snapshots.len(),
        healthy_servers: healthy.len(),
        server_list: healthy,
    })
}

/// GET /servers - detailed registry snapshot.
async fn handle_servers(State(state): State<Arc<AppState>>) -> axum::response::Response {
    Json(json!({"servers": state.registry.snapshot()})).into_response()
}

/// GET /status - human-readable summary.
async fn handle_status(State(state): State<Arc<AppState>>) -> String {
    let snapshots = state.registry.snapshot();
    let index = state.index.load();
    let metrics = state.metrics.snapshot();
    let healthy = snapshots.iter().filter(|s| s.healthy).count();

    let mut out = String::new();
    out.push_str(&format!("mcp-hub v{}\n", env!("CARGO_PKG_VERSION")));
    out.push_str(&format!(
        "uptime: {}s\n",
        state.start_time.elapsed().as_secs()
    ));
    out.push_str(&format!("backends: {healthy}/{} healthy\n", snapshots.len()));
    for s in &snapshots {
        out.push_str(&format!(
            "  [{}] {} {} (errors: {})\n",
            s.state, s.name, s.url, s.consecutive_errors
        ));
    }
    out.push_str(&format!(
        "index: {} tools, {} resources, {} prompts\n",
        index.tool_count(),
        index.resource_count(),
        index.prompt_count()
    ));
    out.push_str(&format!(
        "counters: capability_conflicts={} dropped_notifications={}",
        metrics.capability_conflicts_total, metrics.dropped_notifications_total
    ));
    for (kind, count) in &metrics.errors_total {
        out.push_str(&format!(" errors.{kind}={count}"));
    }
    out.push('\n');
    out
}
