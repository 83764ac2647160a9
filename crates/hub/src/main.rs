//! MCP Hub
//!
//! Aggregates a fleet of MCP servers, discovered from a compose file,
//! behind a single MCP endpoint.

mod client;
mod compose;
mod config;
mod control;
mod error;
mod health;
mod index;
mod jsonrpc;
mod metrics;
mod registry;
mod router;

use crate::config::{CliOverrides, ProxyConfig};
use clap::Parser;
use std::io::{IsTerminal as _, stdout};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "mcp-hub")]
#[command(version, about = "MCP aggregation proxy: one endpoint for a fleet of MCP servers")]
struct CliArgs {
    /// Port to listen on (0 = ephemeral).
    #[arg(long, env = "PROXY_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Compose file describing the backend fleet.
    #[arg(
        short = 'c',
        long = "config",
        env = "MCP_COMPOSE_FILE",
        default_value = config::DEFAULT_COMPOSE_FILE
    )]
    config: PathBuf,

    /// Log level. Supports tracing filter syntax.
    #[arg(
        short = 'l',
        long = "log-level",
        env = "LOG_LEVEL",
        default_value = config::DEFAULT_LOG_LEVEL
    )]
    log_level: String,

    /// Seconds between health-probe sweeps.
    #[arg(
        long = "probe-interval-seconds",
        env = "PROXY_PROBE_INTERVAL_SECONDS",
        default_value_t = config::DEFAULT_PROBE_INTERVAL_SECS
    )]
    probe_interval_seconds: u64,

    /// Consecutive probe failures before a healthy backend is demoted.
    #[arg(
        long = "fail-threshold",
        env = "PROXY_FAIL_THRESHOLD",
        default_value_t = config::DEFAULT_FAIL_THRESHOLD
    )]
    fail_threshold: u32,

    /// Append logs to this file instead of stdout (used by background
    /// mode).
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config = ProxyConfig::resolve(CliOverrides {
        port: args.port,
        compose_file: args.config,
        log_level: args.log_level,
        probe_interval_seconds: args.probe_interval_seconds,
        fail_threshold: args.fail_threshold,
        log_file: args.log_file,
    });

    if let Err(e) = init_logging(&config) {
        eprintln!("mcp-hub: {e}");
        return ExitCode::from(3);
    }

    tracing::info!("Starting MCP Hub proxy v{VERSION}");

    match control::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "proxy exited with error");
            ExitCode::from(control::exit_code_for(&e))
        }
    }
}

/// Human-readable logs on a TTY, JSON otherwise; a `--log-file` always gets
/// the plain (non-ANSI) format.
fn init_logging(config: &ProxyConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_new(config.log_level.to_ascii_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = &config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .init();
        return Ok(());
    }

    if stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
    Ok(())
}
