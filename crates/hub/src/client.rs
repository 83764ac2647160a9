//! Minimal MCP JSON-RPC 2.0 client for a single backend.
//!
//! One request/response JSON object per HTTP POST against the backend's
//! origin; no sessions, no streaming. The client never retries — retry
//! policy belongs to the router.

use crate::error::{HubError, Result};
use crate::jsonrpc::{Request, Response};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Idle connections kept pooled per backend origin.
const POOL_MAX_IDLE_PER_HOST: usize = 16;

const CLIENT_NAME: &str = "mcp-hub";
const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct McpClient {
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl McpClient {
    /// Build the shared outbound client.
    ///
    /// Redirects are not followed: a backend answering an MCP POST with a
    /// redirect is misbehaving, and following it would silently re-route
    /// requests.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| HubError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `GET {base_url}/health`; success is any 2xx within `timeout`.
    pub async fn probe_health(&self, base_url: &str, timeout: Duration) -> Result<()> {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let response = tokio::time::timeout(timeout, self.http.get(&url).send())
            .await
            .map_err(|_| HubError::Transport(format!("health probe timed out after {timeout:?}")))?
            .map_err(|e| HubError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(HubError::Transport(format!(
                "health probe returned HTTP {}",
                response.status()
            )))
        }
    }

    /// Issue `method` with `params` and return the JSON-RPC `result`.
    ///
    /// A well-formed JSON-RPC error response becomes
    /// [`HubError::Application`].
    pub async fn call(
        &self,
        base_url: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id();
        let request = Request::new(json!(id), method, params);
        let response = self.post_request(base_url, &request, id, timeout).await?;
        match (response.result, response.error) {
            (_, Some(err)) => Err(HubError::Application {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(HubError::Protocol(
                "response carries neither result nor error".to_string(),
            )),
        }
    }

    /// MCP `initialize`, returning the raw result object.
    pub async fn initialize(&self, base_url: &str, timeout: Duration) -> Result<Value> {
        self.call(
            base_url,
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"roots": {"listChanged": false}, "sampling": {}},
                "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
            })),
            timeout,
        )
        .await
    }

    /// Forward a client envelope verbatim, under a freshly generated
    /// internal id. The returned response still carries the internal id;
    /// the router owns the rewrite back to the caller's id.
    pub async fn forward(
        &self,
        base_url: &str,
        incoming: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let id = self.next_id();
        let mut request = incoming.clone();
        request.id = Some(json!(id));
        self.post_request(base_url, &request, id, timeout).await
    }

    /// Fire a notification (no id, no reply expected). Any 2xx counts as
    /// delivered.
    pub async fn notify(&self, base_url: &str, notification: &Request, timeout: Duration) -> Result<()> {
        let response = tokio::time::timeout(
            timeout,
            self.http.post(base_url).json(notification).send(),
        )
        .await
        .map_err(|_| HubError::Transport(format!("notification timed out after {timeout:?}")))?
        .map_err(|e| HubError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(HubError::Transport(format!(
                "notification returned HTTP {}",
                response.status()
            )))
        }
    }

    async fn post_request(
        &self,
        base_url: &str,
        request: &Request,
        expected_id: u64,
        timeout: Duration,
    ) -> Result<Response> {
        let response = tokio::time::timeout(timeout, self.http.post(base_url).json(request).send())
            .await
            .map_err(|_| {
                HubError::Transport(format!("{} timed out after {timeout:?}", request.method))
            })?
            .map_err(|e| HubError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HubError::Transport(format!(
                "{} returned HTTP {status}",
                request.method
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| HubError::Transport(format!("reading response body: {e}")))?;
        let envelope: Response = serde_json::from_slice(&body)
            .map_err(|e| HubError::Protocol(format!("invalid JSON-RPC response: {e}")))?;

        if envelope.jsonrpc != "2.0" {
            return Err(HubError::Protocol(format!(
                "unexpected jsonrpc version '{}'",
                envelope.jsonrpc
            )));
        }
        if envelope.id != json!(expected_id) {
            return Err(HubError::Protocol(format!(
                "response id {} does not match request id {expected_id}",
                envelope.id
            )));
        }
        Ok(envelope)
    }
}
