//! Control CLI for the MCP Hub aggregation proxy.
//!
//! Exit codes: 0 success, 1 operational warning (running but degraded),
//! 2 not running / not reachable, 3 configuration error.

mod api;
mod proc;

use crate::api::HubApi;
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const EXIT_OK: u8 = 0;
const EXIT_DEGRADED: u8 = 1;
const EXIT_NOT_RUNNING: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "mcp-hubctl")]
#[command(version, about = "Manage the MCP Hub aggregation proxy")]
struct Cli {
    /// Proxy port (management surface and MCP endpoint).
    #[arg(long, env = "PROXY_PORT", default_value_t = 3000, global = true)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the aggregation proxy process
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCommand {
    /// Start the proxy server
    Start(StartArgs),
    /// Stop the proxy server
    Stop,
    /// Restart the proxy server
    Restart(StartArgs),
    /// Show proxy health and backend summary
    Status,
    /// List all backend MCP servers
    Servers,
    /// Show proxy logs (background mode only)
    Logs(LogsArgs),
}

#[derive(Args, Debug, Clone)]
struct StartArgs {
    /// Compose file describing the backend fleet.
    #[arg(long = "config", env = "MCP_COMPOSE_FILE", default_value = "./docker-compose.yml")]
    config: PathBuf,

    /// Log level passed to the proxy.
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "INFO")]
    log_level: String,

    /// Run detached, logging to ~/.mcp-hub/proxy.log.
    #[arg(long)]
    background: bool,
}

#[derive(Args, Debug)]
struct LogsArgs {
    /// Number of lines to show.
    #[arg(long, default_value_t = 50)]
    lines: usize,

    /// Follow log output.
    #[arg(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(EXIT_DEGRADED)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let api = HubApi::new(cli.port)?;
    let Command::Proxy { command } = cli.command;
    match command {
        ProxyCommand::Start(args) => start(&api, cli.port, &args).await,
        ProxyCommand::Stop => stop(&api).await,
        ProxyCommand::Restart(args) => {
            let _ = stop(&api).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            start(&api, cli.port, &args).await
        }
        ProxyCommand::Status => status(&api).await,
        ProxyCommand::Servers => servers(&api).await,
        ProxyCommand::Logs(args) => logs(&args).await,
    }
}

async fn start(api: &HubApi, port: u16, args: &StartArgs) -> anyhow::Result<u8> {
    if let Some(pid) = proc::read_live_pid()? {
        if api.health().await.is_ok() {
            println!("{} proxy already running (PID {pid})", "ok:".green().bold());
            println!("endpoint: {}", api.endpoint());
            return Ok(EXIT_OK);
        }
        // Stale process entry; fall through and start fresh.
        proc::remove_pid_file()?;
    }

    if !args.config.exists() {
        eprintln!(
            "{} compose file not found: {}",
            "error:".red().bold(),
            args.config.display()
        );
        return Ok(EXIT_CONFIG);
    }

    let binary = proxy_binary();
    let mut command = std::process::Command::new(&binary);
    command
        .arg("--port")
        .arg(port.to_string())
        .arg("--config")
        .arg(&args.config)
        .arg("--log-level")
        .arg(&args.log_level);

    if !args.background {
        println!("starting MCP Hub proxy (foreground, Ctrl+C to stop)...");
        let status = command.status()?;
        return Ok(u8::try_from(status.code().unwrap_or(1)).unwrap_or(1));
    }

    let log_path = proc::log_file()?;
    command
        .arg("--log-file")
        .arg(&log_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    println!("starting MCP Hub proxy in background...");
    let child = command.spawn()?;
    proc::save_pid(child.id())?;

    // Give it a moment to bind and run first discovery.
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if let Ok(health) = api.health().await {
            println!(
                "{} proxy started (PID {})",
                "ok:".green().bold(),
                child.id()
            );
            println!("endpoint: {}", api.endpoint());
            println!(
                "backends: {}/{} healthy",
                health.healthy_servers, health.servers
            );
            return Ok(EXIT_OK);
        }
    }

    eprintln!(
        "{} proxy did not become reachable; check `mcp-hubctl proxy logs`",
        "error:".red().bold()
    );
    Ok(EXIT_NOT_RUNNING)
}

/// The proxy binary normally sits next to this one; fall back to PATH.
fn proxy_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("mcp-hub")))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("mcp-hub"))
}

async fn stop(api: &HubApi) -> anyhow::Result<u8> {
    let Some(pid) = proc::read_live_pid()? else {
        if api.health().await.is_err() {
            println!("proxy not running");
            return Ok(EXIT_OK);
        }
        println!(
            "{} proxy reachable but PID file missing; stop it manually",
            "warning:".yellow().bold()
        );
        return Ok(EXIT_DEGRADED);
    };

    proc::terminate(pid)?;
    for _ in 0..20 {
        if !proc::process_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    if proc::process_alive(pid) {
        println!("{} forcing stop...", "warning:".yellow().bold());
        proc::force_kill(pid)?;
    }
    proc::remove_pid_file()?;
    println!("{} stopped proxy (PID {pid})", "ok:".green().bold());
    Ok(EXIT_OK)
}

async fn status(api: &HubApi) -> anyhow::Result<u8> {
    let health = match api.health().await {
        Ok(h) => h,
        Err(_) => {
            println!("{} MCP Hub proxy: NOT RUNNING", "down:".red().bold());
            if let Some(pid) = proc::read_live_pid()? {
                println!(
                    "{} process {pid} exists but is not answering",
                    "warning:".yellow().bold()
                );
            }
            println!("start with: mcp-hubctl proxy start");
            return Ok(EXIT_NOT_RUNNING);
        }
    };

    println!(
        "{} MCP Hub proxy: RUNNING ({})",
        "up:".green().bold(),
        health.status
    );
    if let Some(pid) = proc::read_live_pid()? {
        println!("pid: {pid}");
    }
    println!("endpoint: {}", api.endpoint());
    println!(
        "backends: {}/{} healthy",
        health.healthy_servers, health.servers
    );

    if let Ok(servers) = api.servers().await {
        for server in &servers {
            let marker = if server.healthy {
                "up".green().to_string()
            } else {
                "down".red().to_string()
            };
            let errors = if server.consecutive_errors > 0 {
                format!(" (errors: {})", server.consecutive_errors)
            } else {
                String::new()
            };
            println!("  [{marker}] {}: {}{errors}", server.name, server.url);
        }
    }

    if health.healthy_servers < health.servers {
        Ok(EXIT_DEGRADED)
    } else {
        Ok(EXIT_OK)
    }
}

async fn servers(api: &HubApi) -> anyhow::Result<u8> {
    let servers = match api.servers().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            println!("start with: mcp-hubctl proxy start");
            return Ok(EXIT_NOT_RUNNING);
        }
    };

    if servers.is_empty() {
        println!("no backend servers configured");
        return Ok(EXIT_OK);
    }

    println!("{} backend server(s):", servers.len());
    for server in &servers {
        let marker = if server.healthy {
            "up".green().to_string()
        } else {
            "down".red().to_string()
        };
        println!("\n[{marker}] {}", server.name.bold());
        println!("    url: {}", server.url);
        if let Some(state) = &server.state {
            println!("    state: {state}");
        }
        if let Some(at) = &server.last_probe_at {
            println!("    last probe: {at}");
        }
        if server.consecutive_errors > 0 {
            println!("    errors: {}", server.consecutive_errors);
        }
        if let Some(caps) = &server.capabilities
            && let Some(obj) = caps.as_object()
        {
            let sections: Vec<&str> = obj.keys().map(String::as_str).collect();
            if !sections.is_empty() {
                println!("    capabilities: {}", sections.join(", "));
            }
        }
    }
    Ok(EXIT_OK)
}

async fn logs(args: &LogsArgs) -> anyhow::Result<u8> {
    let path = proc::log_file()?;
    if !path.exists() {
        println!("no proxy logs found (logs are written in background mode only)");
        return Ok(EXIT_OK);
    }

    let text = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(args.lines);
    for line in &lines[start..] {
        println!("{line}");
    }

    if !args.follow {
        return Ok(EXIT_OK);
    }

    // tail -f: poll for appended bytes.
    let mut offset = text.len() as u64;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let metadata = std::fs::metadata(&path)?;
        if metadata.len() < offset {
            // Truncated/rotated; start over.
            offset = 0;
        }
        if metadata.len() > offset {
            use std::io::{Read as _, Seek as _};
            let mut file = std::fs::File::open(&path)?;
            file.seek(std::io::SeekFrom::Start(offset))?;
            let mut fresh = String::new();
            file.read_to_string(&mut fresh)?;
            offset += fresh.len() as u64;
            print!("{fresh}");
        }
    }
}
