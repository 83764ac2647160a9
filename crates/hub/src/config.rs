//! Immutable proxy configuration.
//!
//! Resolved once at startup (flag > env > default) and passed explicitly to
//! components; nothing reads process-wide state after this point.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_COMPOSE_FILE: &str = "./docker-compose.yml";
pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;

const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen port; 0 binds an ephemeral port (the actual address is
    /// logged).
    pub port: u16,
    pub compose_file: PathBuf,
    pub log_level: String,
    pub probe_interval: Duration,
    /// Per-probe `GET /health` budget.
    pub probe_timeout: Duration,
    /// Per-call budget for each capability-refresh call.
    pub refresh_timeout: Duration,
    /// Overall deadline for one incoming MCP request.
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Consecutive probe failures before a healthy backend is demoted.
    pub fail_threshold: u32,
    pub log_file: Option<PathBuf>,
}

/// The subset of configuration that arrives via CLI flags (which clap has
/// already merged with their env fallbacks).
#[derive(Debug, Clone)]
pub struct CliOverrides {
    pub port: u16,
    pub compose_file: PathBuf,
    pub log_level: String,
    pub probe_interval_seconds: u64,
    pub fail_threshold: u32,
    pub log_file: Option<PathBuf>,
}

impl ProxyConfig {
    /// Assemble the full configuration. The timeout knobs are env-only
    /// tunables; everything else comes from the (flag/env-merged) CLI.
    #[must_use]
    pub fn resolve(cli: CliOverrides) -> Self {
        Self {
            port: cli.port,
            compose_file: cli.compose_file,
            log_level: cli.log_level,
            probe_interval: Duration::from_secs(cli.probe_interval_seconds.max(1)),
            probe_timeout: Duration::from_secs(
                mcp_hub_env::positive_u64("PROXY_PROBE_TIMEOUT_SECONDS")
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS),
            ),
            refresh_timeout: Duration::from_secs(
                mcp_hub_env::positive_u64("PROXY_REFRESH_TIMEOUT_SECONDS")
                    .unwrap_or(DEFAULT_REFRESH_TIMEOUT_SECS),
            ),
            request_timeout: Duration::from_secs(
                mcp_hub_env::positive_u64("PROXY_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            shutdown_grace: Duration::from_secs(
                mcp_hub_env::positive_u64("PROXY_SHUTDOWN_GRACE_SECONDS")
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
            fail_threshold: cli.fail_threshold.max(1),
            log_file: cli.log_file,
        }
    }
}
