#![allow(dead_code)]

use anyhow::Context as _;
use serde_json::{Value, json};
use std::io::BufRead as _;
use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Kills the proxy process when a test scope ends, pass or fail.
#[derive(Debug)]
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[derive(Debug)]
pub struct SpawnedProxy {
    pub child: KillOnDrop,
    pub base: String,
}

impl SpawnedProxy {
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.0.id()
    }

    /// Ask the proxy to re-read its compose file.
    #[cfg(unix)]
    pub fn reload(&self) {
        unsafe {
            libc::kill(self.pid() as i32, libc::SIGHUP);
        }
    }
}

fn parse_listen_addr(line: &str) -> Option<String> {
    let marker = "MCP Hub proxy listening on http://";
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    // Logs are JSON off-TTY; the address ends at the next quote or escape.
    let end = rest
        .find('"')
        .or_else(|| rest.find('\\'))
        .or_else(|| rest.find('}'))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

/// Spawn the proxy binary against `compose_path` with a fast probe cadence
/// and wait for it to announce its listen address.
pub fn spawn_proxy(compose_path: &std::path::Path, extra_env: &[(&str, &str)]) -> anyhow::Result<SpawnedProxy> {
    let bin = env!("CARGO_BIN_EXE_mcp-hub");
    let mut cmd = Command::new(bin);
    cmd.arg("--port")
        .arg("0")
        .arg("--config")
        .arg(compose_path)
        .arg("--log-level")
        .arg("info")
        .arg("--probe-interval-seconds")
        .arg("1")
        .env("PROXY_PROBE_TIMEOUT_SECONDS", "2")
        .env("PROXY_REFRESH_TIMEOUT_SECONDS", "2")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    let mut child = cmd.spawn().context("spawn mcp-hub")?;

    let stdout = child.stdout.take().context("missing child stdout")?;
    let stderr = child.stderr.take().context("missing child stderr")?;
    let (tx, rx) = mpsc::channel::<String>();
    let tx_err = tx.clone();
    std::thread::spawn(move || {
        for line in std::io::BufReader::new(stdout).lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });
    std::thread::spawn(move || {
        for line in std::io::BufReader::new(stderr).lines().map_while(Result::ok) {
            let _ = tx_err.send(line);
        }
    });

    let start = Instant::now();
    let mut last_lines: Vec<String> = Vec::new();
    while start.elapsed() < Duration::from_secs(10) {
        if let Ok(Some(status)) = child.try_wait() {
            anyhow::bail!(
                "proxy exited early ({status}); output:\n{}",
                last_lines.join("\n")
            );
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if last_lines.len() >= 50 {
                    last_lines.remove(0);
                }
                last_lines.push(line.clone());
                if let Some(addr) = parse_listen_addr(&line) {
                    return Ok(SpawnedProxy {
                        child: KillOnDrop(child),
                        base: format!("http://{addr}"),
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = child.kill();
    anyhow::bail!(
        "timed out waiting for proxy address; output:\n{}",
        last_lines.join("\n")
    )
}

/// Poll `/health` until `healthy_servers` reaches `want`.
pub async fn wait_healthy(base: &str, want: usize, timeout: Duration) -> anyhow::Result<Value> {
    let deadline = Instant::now() + timeout;
    let mut last = Value::Null;
    while Instant::now() < deadline {
        if let Ok(resp) = reqwest::get(format!("{base}/health")).await {
            if let Ok(body) = resp.json::<Value>().await {
                if body["healthy_servers"] == json!(want) {
                    return Ok(body);
                }
                last = body;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    anyhow::bail!("timed out waiting for {want} healthy servers; last /health: {last}")
}

pub async fn rpc(base: &str, body: Value) -> anyhow::Result<Value> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/mcp"))
        .json(&body)
        .send()
        .await?
        .json()
        .await?;
    Ok(resp)
}

// ============================================================================
// In-process mock MCP backend
// ============================================================================

pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockBackendState>,
    shutdown: CancellationToken,
}

struct MockBackendState {
    name: String,
    tools: Vec<Value>,
    resources: Vec<Value>,
    prompts: Vec<Value>,
    healthy: AtomicBool,
    mcp_failing: AtomicBool,
    call_delay_ms: AtomicU64,
    tool_calls: AtomicU32,
}

impl MockBackend {
    pub async fn start(name: &str, tools: Vec<Value>) -> anyhow::Result<Self> {
        Self::start_full(name, tools, Vec::new(), Vec::new()).await
    }

    pub async fn start_full(
        name: &str,
        tools: Vec<Value>,
        resources: Vec<Value>,
        prompts: Vec<Value>,
    ) -> anyhow::Result<Self> {
        use axum::extract::State;
        use axum::routing::{get, post};

        let state = Arc::new(MockBackendState {
            name: name.to_string(),
            tools,
            resources,
            prompts,
            healthy: AtomicBool::new(true),
            mcp_failing: AtomicBool::new(false),
            call_delay_ms: AtomicU64::new(0),
            tool_calls: AtomicU32::new(0),
        });

        async fn health(State(state): State<Arc<MockBackendState>>) -> axum::response::Response {
            use axum::response::IntoResponse as _;
            if state.healthy.load(Ordering::Relaxed) {
                (axum::http::StatusCode::OK, axum::Json(json!({"status": "ok"}))).into_response()
            } else {
                axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        }

        async fn mcp(
            State(state): State<Arc<MockBackendState>>,
            axum::Json(body): axum::Json<Value>,
        ) -> axum::response::Response {
            use axum::response::IntoResponse as _;
            if state.mcp_failing.load(Ordering::Relaxed) {
                return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            let id = body.get("id").cloned().unwrap_or(Value::Null);
            let method = body["method"].as_str().unwrap_or_default();
            let result = match method {
                "initialize" => json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {"name": state.name, "version": "0.0.0"},
                }),
                "tools/list" => json!({"tools": state.tools}),
                "resources/list" => json!({"resources": state.resources}),
                "prompts/list" => json!({"prompts": state.prompts}),
                "tools/call" => {
                    let delay = state.call_delay_ms.load(Ordering::Relaxed);
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    state.tool_calls.fetch_add(1, Ordering::Relaxed);
                    let tool = body["params"]["name"].as_str().unwrap_or_default();
                    json!({"content": [{"type": "text", "text": format!("{}:{tool}", state.name)}]})
                }
                "resources/read" => json!({
                    "contents": [{
                        "uri": body["params"]["uri"],
                        "text": format!("served by {}", state.name),
                    }],
                }),
                "prompts/get" => json!({
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": format!("prompt from {}", state.name)},
                    }],
                }),
                _ => {
                    return axum::Json(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": "Method not found"},
                    }))
                    .into_response();
                }
            };
            axum::Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
        }

        let app = axum::Router::new()
            .route("/health", get(health))
            .route("/", post(mcp))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let serve_ct = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_ct.cancelled().await })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            state,
            shutdown,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Fail both the health probe and the MCP endpoint.
    pub fn fail_completely(&self) {
        self.state.healthy.store(false, Ordering::Relaxed);
        self.state.mcp_failing.store(true, Ordering::Relaxed);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        self.state
            .call_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tool_calls(&self) -> u32 {
        self.state.tool_calls.load(Ordering::Relaxed)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Write a compose file mapping each `(service, host_port)` to a backend.
pub fn write_compose(
    dir: &std::path::Path,
    services: &[(&str, u16)],
) -> anyhow::Result<std::path::PathBuf> {
    let mut doc = String::from("services:\n");
    for (name, port) in services {
        doc.push_str(&format!(
            "  {name}:\n    image: example/{name}\n    ports:\n      - '{port}:8080'\n"
        ));
    }
    let path = dir.join("docker-compose.yml");
    std::fs::write(&path, doc)?;
    Ok(path)
}
