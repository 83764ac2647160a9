//! Compose-document discovery.
//!
//! The proxy consumes a container-compose YAML file and turns every service
//! with a host port binding into a candidate backend. It never starts
//! containers; the compose file is purely a service directory.

use crate::error::{HubError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Label reserved for marking the proxy's own service so it never routes to
/// itself.
pub const PROXY_SERVICE_LABEL: &str = "mcp-hub.service";
pub const PROXY_SERVICE_LABEL_VALUE: &str = "proxy";

/// Service name the proxy historically ran under; skipped for the same
/// self-routing reason as the label.
const PROXY_SERVICE_NAME: &str = "mcp-proxy";

/// A candidate backend discovered from the compose document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBackend {
    pub name: String,
    pub base_url: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ComposeDocument {
    #[serde(default)]
    services: BTreeMap<String, ServiceSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<PortMapping>,
    #[serde(default)]
    labels: Option<LabelsSpec>,
}

/// Compose supports a short string form (`"8081:8080"`, optionally with a
/// host-ip prefix and/or protocol suffix), a bare container port, and a long
/// mapping form with `published`/`target`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortMapping {
    Short(String),
    ContainerOnly(u64),
    Long {
        #[serde(default)]
        published: Option<PublishedPort>,
        #[serde(default)]
        #[allow(dead_code)]
        target: Option<u64>,
    },
}

/// `published` may be written as a number or a (possibly `${VAR}`) string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PublishedPort {
    Number(u64),
    Text(String),
}

/// Labels come as a map or as a list of `key=value` strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelsSpec {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

impl LabelsSpec {
    fn normalize(&self) -> BTreeMap<String, String> {
        match self {
            LabelsSpec::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), yaml_scalar_to_string(v)))
                .collect(),
            LabelsSpec::List(entries) => entries
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                    None => (entry.trim().to_string(), String::new()),
                })
                .collect(),
        }
    }
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

/// Read and parse the compose file at `path`.
///
/// An unreadable or malformed document is a [`HubError::Config`]. A document
/// that yields no backends is not an error: the proxy starts empty and
/// serves empty lists.
pub fn discover(path: &Path) -> Result<Vec<DiscoveredBackend>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        HubError::Config(format!("cannot read compose file {}: {e}", path.display()))
    })?;
    parse_compose(&text)
}

/// Parse a compose document into candidate backends.
///
/// Services are yielded in name order regardless of document order, so
/// discovery output is stable under service reordering.
pub fn parse_compose(text: &str) -> Result<Vec<DiscoveredBackend>> {
    let doc: ComposeDocument = serde_yaml::from_str(text)
        .map_err(|e| HubError::Config(format!("malformed compose document: {e}")))?;

    let mut backends = Vec::new();
    for (name, spec) in &doc.services {
        let labels = spec
            .labels
            .as_ref()
            .map(LabelsSpec::normalize)
            .unwrap_or_default();

        if name == PROXY_SERVICE_NAME
            || labels.get(PROXY_SERVICE_LABEL).map(String::as_str) == Some(PROXY_SERVICE_LABEL_VALUE)
        {
            continue;
        }

        let Some(host_port) = first_host_port(&spec.ports)? else {
            // No host binding: the service is not reachable from the proxy.
            continue;
        };

        backends.push(DiscoveredBackend {
            name: name.clone(),
            base_url: format!("http://localhost:{host_port}"),
            labels,
        });
    }

    Ok(backends)
}

fn first_host_port(ports: &[PortMapping]) -> Result<Option<u16>> {
    for mapping in ports {
        match mapping {
            PortMapping::Short(raw) => {
                let expanded = mcp_hub_env::expand_env_string(raw).map_err(HubError::Config)?;
                if let Some(port) = host_port_from_short(&expanded)? {
                    return Ok(Some(port));
                }
            }
            PortMapping::ContainerOnly(_) => {}
            PortMapping::Long { published, .. } => match published {
                Some(PublishedPort::Number(n)) => return Ok(Some(parse_port(&n.to_string())?)),
                Some(PublishedPort::Text(raw)) => {
                    let expanded = mcp_hub_env::expand_env_string(raw).map_err(HubError::Config)?;
                    // Long-form `published` may itself be a range; take the
                    // low end.
                    let first = expanded.split('-').next().unwrap_or(&expanded);
                    return Ok(Some(parse_port(first)?));
                }
                None => {}
            },
        }
    }
    Ok(None)
}

/// Extract the host port from a compose short-form mapping.
///
/// Handles `"8081:8080"`, `"127.0.0.1:8081:8080"`, and a trailing
/// `"/protocol"` suffix. A bare `"8080"` has no host binding.
fn host_port_from_short(raw: &str) -> Result<Option<u16>> {
    let without_proto = raw.split('/').next().unwrap_or(raw);
    let parts: Vec<&str> = without_proto.split(':').collect();
    let host_part = match parts.as_slice() {
        [_container] => return Ok(None),
        [host, _container] => host,
        [_ip, host, _container] => host,
        _ => {
            return Err(HubError::Config(format!(
                "unrecognized port mapping '{raw}'"
            )));
        }
    };
    // Host side may be a range ("8081-8083:8080"); the first port wins.
    let first = host_part.split('-').next().unwrap_or(host_part);
    parse_port(first).map(Some)
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| HubError::Config(format!("invalid host port '{s}'")))
}
