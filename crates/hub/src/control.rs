//! Lifecycle orchestration: startup order, reload, graceful shutdown.
//!
//! Startup: parse compose → seed registry → serve HTTP (with
//! `healthy_servers=0` until probes land) → start the health monitor, whose
//! first sweep runs immediately.

use crate::client::McpClient;
use crate::compose::{self, DiscoveredBackend};
use crate::config::ProxyConfig;
use crate::error::HubError;
use crate::health::{HealthMonitor, ProbeContext};
use crate::index::IndexPublisher;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::router::{self, AppState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    // Startup config errors are fatal; reload errors later are not.
    let discovered = compose::discover(&config.compose_file)?;
    tracing::info!(
        backends = discovered.len(),
        compose_file = %config.compose_file.display(),
        "discovery complete"
    );

    let registry = Arc::new(Registry::new(config.fail_threshold));
    seed_registry(&registry, &discovered);

    let metrics = Arc::new(Metrics::default());
    let publisher = Arc::new(IndexPublisher::new(metrics.clone()));
    let client = Arc::new(McpClient::new()?);

    let state = Arc::new(AppState::new(
        registry.clone(),
        publisher.clone(),
        client.clone(),
        metrics.clone(),
        config.request_timeout,
    ));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("MCP Hub proxy listening on http://{addr}");

    let shutdown = CancellationToken::new();

    let serve_shutdown = shutdown.clone();
    let app = router::router(state);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await
    });

    let monitor = HealthMonitor::new(
        ProbeContext {
            registry: registry.clone(),
            client,
            publisher: publisher.clone(),
            metrics,
            probe_timeout: config.probe_timeout,
            refresh_timeout: config.refresh_timeout,
            shutdown: shutdown.clone(),
        },
        config.probe_interval,
    );
    let waker = monitor.waker();
    let monitor_handle = monitor.spawn();

    spawn_reload_task(
        config.clone(),
        registry.clone(),
        publisher.clone(),
        waker,
        shutdown.clone(),
    );

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");
    shutdown.cancel();

    let _ = monitor_handle.await;
    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(joined) => {
            joined??;
            tracing::info!("shutdown complete");
            Ok(())
        }
        Err(_) => anyhow::bail!(
            "in-flight requests did not drain within {:?}",
            config.shutdown_grace
        ),
    }
}

fn seed_registry(registry: &Registry, discovered: &[DiscoveredBackend]) {
    for backend in discovered {
        registry.upsert(&backend.name, &backend.base_url, backend.labels.clone());
        tracing::info!(backend = %backend.name, url = %backend.base_url, "discovered MCP server");
    }
}

/// Re-parse the compose document and diff it against the registry.
///
/// New and changed services are upserted, absent ones removed, and the
/// index is republished. In-flight requests keep the backend snapshot they
/// resolved and are unaffected.
pub(crate) fn apply_reload(
    registry: &Registry,
    publisher: &IndexPublisher,
    discovered: Vec<DiscoveredBackend>,
) {
    let known: HashSet<String> = registry.names().into_iter().collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(discovered.len());

    for backend in discovered {
        let outcome = registry.upsert(&backend.name, &backend.base_url, backend.labels);
        tracing::info!(backend = %backend.name, ?outcome, "reload: upsert");
        seen.insert(backend.name);
    }

    for name in known.difference(&seen) {
        if let Some(t) = registry.remove(name) {
            tracing::info!(
                backend = %name,
                from = %t.from,
                to = %t.to,
                cause = "reload",
                "backend state transition"
            );
        }
    }

    publisher.rebuild(&registry.snapshot());
}

fn spawn_reload_task(
    config: ProxyConfig,
    registry: Arc<Registry>,
    publisher: Arc<IndexPublisher>,
    waker: Arc<Notify>,
    shutdown: CancellationToken,
) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            tracing::warn!("cannot install SIGHUP handler; reload disabled");
            return;
        };
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match compose::discover(&config.compose_file) {
                        Ok(discovered) => {
                            tracing::info!(backends = discovered.len(), "reloading compose file");
                            apply_reload(&registry, &publisher, discovered);
                            // Probe new backends promptly instead of waiting
                            // out the interval.
                            waker.notify_one();
                        }
                        Err(e) => {
                            // Previous registry stays intact.
                            tracing::error!(error = %e, "reload failed; keeping current backends");
                        }
                    }
                }
            }
        }
    });

    #[cfg(not(unix))]
    {
        let _ = (config, registry, publisher, waker, shutdown);
        tracing::debug!("reload via SIGHUP is unix-only");
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

/// Map a fatal startup error to the process exit code contract.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if matches!(err.downcast_ref::<HubError>(), Some(HubError::Config(_))) {
        3
    } else {
        1
    }
}
