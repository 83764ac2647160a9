//! Periodic backend health monitoring.
//!
//! One sweep runs immediately at startup and then every probe interval; a
//! reload can also wake the monitor early. At most one probe per backend is
//! in flight at a time, and probes never run on the router's request path.

use crate::client::McpClient;
use crate::index::IndexPublisher;
use crate::metrics::Metrics;
use crate::registry::{BackendSnapshot, BackendState, CapabilitySurface, Registry, Transition};
use crate::{error::HubError, jsonrpc};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ProbeContext {
    pub registry: Arc<Registry>,
    pub client: Arc<McpClient>,
    pub publisher: Arc<IndexPublisher>,
    pub metrics: Arc<Metrics>,
    pub probe_timeout: Duration,
    pub refresh_timeout: Duration,
    pub shutdown: CancellationToken,
}

pub struct HealthMonitor {
    ctx: ProbeContext,
    probe_interval: Duration,
    wake: Arc<Notify>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(ctx: ProbeContext, probe_interval: Duration) -> Self {
        Self {
            ctx,
            probe_interval,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle the control plane uses to trigger an early sweep (after a
    /// reload).
    #[must_use]
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut probes: JoinSet<String> = JoinSet::new();
        let mut interval = tokio::time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.ctx.shutdown.cancelled() => break,
                _ = interval.tick() => self.sweep(&mut in_flight, &mut probes),
                () = self.wake.notified() => self.sweep(&mut in_flight, &mut probes),
                Some(finished) = probes.join_next() => {
                    if let Ok(name) = finished {
                        in_flight.remove(&name);
                    }
                }
            }
        }

        probes.shutdown().await;
        tracing::debug!("health monitor stopped");
    }

    fn sweep(&self, in_flight: &mut HashSet<String>, probes: &mut JoinSet<String>) {
        for snapshot in self.ctx.registry.snapshot() {
            if in_flight.contains(&snapshot.name) {
                continue;
            }
            in_flight.insert(snapshot.name.clone());
            let ctx = self.ctx.clone();
            let name = snapshot.name.clone();
            probes.spawn(async move {
                probe_one(&ctx, snapshot).await;
                name
            });
        }
    }
}

/// Run one probe against one backend and apply the resulting transition.
///
/// A cancellation observed mid-probe is a non-event: no state changes.
pub(crate) async fn probe_one(ctx: &ProbeContext, backend: BackendSnapshot) {
    let name = backend.name.as_str();
    if let Some(t) = ctx.registry.mark_probing(name) {
        log_transition(name, t, "probe start");
    }

    let outcome = tokio::select! {
        () = ctx.shutdown.cancelled() => return,
        r = probe_and_refresh(ctx, &backend) => r,
    };

    let (transition, cause) = match outcome {
        Ok(surface) => (ctx.registry.mark_healthy(name, surface), "probe ok"),
        Err((err, cause)) => {
            ctx.metrics.incr_error(err.kind());
            tracing::debug!(backend = name, error = %err, "probe failed");
            (ctx.registry.mark_unhealthy(name), cause)
        }
    };

    if let Some(t) = transition
        && t.from != t.to
    {
        log_transition(name, t, cause);
        ctx.publisher.rebuild(&ctx.registry.snapshot());
    }
}

/// `GET /health`, plus a full capability refresh on the first success after
/// a non-`Healthy` state. Returns the refreshed surface (`None` when the
/// backend was already healthy and its cached surface stands).
async fn probe_and_refresh(
    ctx: &ProbeContext,
    backend: &BackendSnapshot,
) -> Result<Option<Arc<CapabilitySurface>>, (HubError, &'static str)> {
    ctx.client
        .probe_health(&backend.url, ctx.probe_timeout)
        .await
        .map_err(|e| (e, "probe failed"))?;

    if backend.state == BackendState::Healthy {
        return Ok(None);
    }

    let surface = refresh_surface(ctx, &backend.url)
        .await
        .map_err(|e| (e, "capability refresh failed"))?;
    Ok(Some(Arc::new(surface)))
}

/// `initialize` followed by the three list calls.
///
/// Transport and protocol failures abort the refresh (the backend is
/// demoted). An application error on a list call means the backend does not
/// serve that capability; it contributes an empty list.
async fn refresh_surface(
    ctx: &ProbeContext,
    base_url: &str,
) -> Result<CapabilitySurface, HubError> {
    let init = ctx
        .client
        .initialize(base_url, ctx.refresh_timeout)
        .await?;
    let server_capabilities = init
        .get("capabilities")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let tools = list_items(ctx, base_url, "tools/list", "tools").await?;
    let resources = list_items(ctx, base_url, "resources/list", "resources").await?;
    let prompts = list_items(ctx, base_url, "prompts/list", "prompts").await?;

    Ok(CapabilitySurface {
        server_capabilities,
        tools,
        resources,
        prompts,
    })
}

async fn list_items(
    ctx: &ProbeContext,
    base_url: &str,
    method: &str,
    key: &str,
) -> Result<Vec<Value>, HubError> {
    match ctx
        .client
        .call(base_url, method, Some(json!({})), ctx.refresh_timeout)
        .await
    {
        Ok(result) => Ok(result
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()),
        Err(HubError::Application { code, .. }) if code == jsonrpc::METHOD_NOT_FOUND => {
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

fn log_transition(backend: &str, t: Transition, cause: &str) {
    tracing::info!(
        backend,
        from = %t.from,
        to = %t.to,
        cause,
        "backend state transition"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_ctx(registry: Arc<Registry>) -> ProbeContext {
        let metrics = Arc::new(Metrics::default());
        ProbeContext {
            registry,
            client: Arc::new(McpClient::new().unwrap()),
            publisher: Arc::new(IndexPublisher::new(metrics.clone())),
            metrics,
            probe_timeout: Duration::from_secs(2),
            refresh_timeout: Duration::from_secs(2),
            shutdown: CancellationToken::new(),
        }
    }

    async fn mount_healthy_mcp_backend(server: &MockServer, tool: &str) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(server)
            .await;
        for (m, result) in [
            (
                "initialize",
                json!({"capabilities": {"tools": {"listChanged": false}}}),
            ),
            ("tools/list", json!({"tools": [{"name": tool}]})),
            ("resources/list", json!({"resources": []})),
            ("prompts/list", json!({"prompts": []})),
        ] {
            Mock::given(method("POST"))
                .and(body_partial_json(json!({"method": m})))
                .respond_with(move |req: &wiremock::Request| {
                    let body: Value = serde_json::from_slice(&req.body).unwrap();
                    ResponseTemplate::new(200).set_body_json(json!({
                        "jsonrpc": "2.0",
                        "id": body["id"],
                        "result": result,
                    }))
                })
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn successful_probe_promotes_and_publishes() {
        let server = MockServer::start().await;
        mount_healthy_mcp_backend(&server, "scrape").await;

        let registry = Arc::new(Registry::new(3));
        registry.upsert("scraper", &server.uri(), BTreeMap::new());
        let ctx = test_ctx(registry.clone());

        probe_one(&ctx, registry.get("scraper").unwrap()).await;

        let snap = registry.get("scraper").unwrap();
        assert_eq!(snap.state, BackendState::Healthy);
        assert!(snap.capabilities.is_some());
        assert_eq!(
            ctx.publisher.load().resolve_tool("scrape"),
            Some("scraper")
        );
    }

    #[tokio::test]
    async fn unreachable_backend_goes_unhealthy() {
        let registry = Arc::new(Registry::new(3));
        registry.upsert("ghost", "http://127.0.0.1:9", BTreeMap::new());
        let ctx = test_ctx(registry.clone());

        probe_one(&ctx, registry.get("ghost").unwrap()).await;

        let snap = registry.get("ghost").unwrap();
        assert_eq!(snap.state, BackendState::Unhealthy);
        assert_eq!(snap.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn refresh_failure_demotes_despite_healthy_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = Arc::new(Registry::new(3));
        registry.upsert("half-up", &server.uri(), BTreeMap::new());
        let ctx = test_ctx(registry.clone());

        probe_one(&ctx, registry.get("half-up").unwrap()).await;

        assert_eq!(
            registry.get("half-up").unwrap().state,
            BackendState::Unhealthy
        );
    }

    #[tokio::test]
    async fn list_method_not_found_contributes_empty_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(move |req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"capabilities": {"tools": {}}},
                }))
            })
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(move |req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"tools": [{"name": "only-tool"}]},
                }))
            })
            .mount(&server)
            .await;
        // resources/list and prompts/get are not implemented by this backend.
        Mock::given(method("POST"))
            .respond_with(move |req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "error": {"code": -32601, "message": "Method not found"},
                }))
            })
            .mount(&server)
            .await;

        let registry = Arc::new(Registry::new(3));
        registry.upsert("tools-only", &server.uri(), BTreeMap::new());
        let ctx = test_ctx(registry.clone());

        probe_one(&ctx, registry.get("tools-only").unwrap()).await;

        let snap = registry.get("tools-only").unwrap();
        assert_eq!(snap.state, BackendState::Healthy);
        let surface = snap.surface.unwrap();
        assert_eq!(surface.tools.len(), 1);
        assert!(surface.resources.is_empty());
        assert!(surface.prompts.is_empty());
    }

    #[tokio::test]
    async fn threshold_demotion_removes_capabilities_from_index() {
        let server = MockServer::start().await;
        mount_healthy_mcp_backend(&server, "scrape").await;

        let registry = Arc::new(Registry::new(3));
        registry.upsert("flappy", &server.uri(), BTreeMap::new());
        let ctx = test_ctx(registry.clone());

        probe_one(&ctx, registry.get("flappy").unwrap()).await;
        assert!(ctx.publisher.load().resolve_tool("scrape").is_some());

        // Point the registry entry at a dead port without resetting state,
        // by failing probes against the stopped server.
        drop(server);
        for expected_state in [
            BackendState::Healthy,
            BackendState::Healthy,
            BackendState::Unhealthy,
        ] {
            probe_one(&ctx, registry.get("flappy").unwrap()).await;
            assert_eq!(registry.get("flappy").unwrap().state, expected_state);
        }
        assert!(ctx.publisher.load().resolve_tool("scrape").is_none());
    }

    #[tokio::test]
    async fn recovery_promotes_and_republishes() {
        let registry = Arc::new(Registry::new(1));
        let ctx = test_ctx(registry.clone());

        // Start against a closed port: backend settles Unhealthy.
        registry.upsert("lazarus", "http://127.0.0.1:9", BTreeMap::new());
        probe_one(&ctx, registry.get("lazarus").unwrap()).await;
        assert_eq!(
            registry.get("lazarus").unwrap().state,
            BackendState::Unhealthy
        );

        // Bring a real backend up at a fresh address.
        let server = MockServer::start().await;
        mount_healthy_mcp_backend(&server, "revive").await;
        // Same backend, new probe target (registry keeps error history).
        registry.upsert("lazarus", &server.uri(), BTreeMap::new());
        probe_one(&ctx, registry.get("lazarus").unwrap()).await;

        let snap = registry.get("lazarus").unwrap();
        assert_eq!(snap.state, BackendState::Healthy);
        assert_eq!(snap.consecutive_errors, 0);
        assert_eq!(
            ctx.publisher.load().resolve_tool("revive"),
            Some("lazarus")
        );
    }

    #[tokio::test]
    async fn cancelled_probe_is_a_non_event() {
        let registry = Arc::new(Registry::new(3));
        registry.upsert("a", "http://127.0.0.1:9", BTreeMap::new());
        let ctx = test_ctx(registry.clone());
        ctx.shutdown.cancel();

        let before = registry.get("a").unwrap();
        probe_one(&ctx, registry.get("a").unwrap()).await;
        let after = registry.get("a").unwrap();
        // mark_probing ran (probe start), but no failure was recorded.
        assert_eq!(after.consecutive_errors, before.consecutive_errors);
        assert_ne!(after.state, BackendState::Unhealthy);
    }
}
