//! Client for the proxy's management HTTP surface.

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSummary {
    pub status: String,
    pub servers: usize,
    pub healthy_servers: usize,
}

/// One `/servers` item. Only the stable subset is typed; everything else
/// (capabilities, labels) stays raw.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub url: String,
    pub healthy: bool,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_probe_at: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: Vec<ServerEntry>,
}

pub struct HubApi {
    base: String,
    http: reqwest::Client,
}

impl HubApi {
    pub fn new(port: u16) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            base: format!("http://127.0.0.1:{port}"),
            http,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/mcp", self.base)
    }

    pub async fn health(&self) -> anyhow::Result<HealthSummary> {
        let response = self
            .http
            .get(format!("{}/health", self.base))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .context("proxy not reachable")?;
        anyhow::ensure!(
            response.status().is_success(),
            "proxy /health returned HTTP {}",
            response.status()
        );
        response.json().await.context("decode /health response")
    }

    pub async fn servers(&self) -> anyhow::Result<Vec<ServerEntry>> {
        let response = self
            .http
            .get(format!("{}/servers", self.base))
            .send()
            .await
            .context("proxy not reachable")?;
        anyhow::ensure!(
            response.status().is_success(),
            "proxy /servers returned HTTP {}",
            response.status()
        );
        let body: ServersResponse = response.json().await.context("decode /servers response")?;
        Ok(body.servers)
    }
}
