//! The published capability index.
//!
//! The router resolves every targeted request through a read-only index
//! rebuilt from registry snapshots whenever a backend's eligibility or
//! advertised surface changes. Publication replaces the whole index at
//! once: readers see either the full old or the full new mapping, never a
//! mix.

use crate::metrics::Metrics;
use crate::registry::BackendSnapshot;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable capability → backend mapping plus the aggregated list bodies
/// served to clients.
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    tool_owner: HashMap<String, String>,
    prompt_owner: HashMap<String, String>,
    /// `(uri_or_prefix, backend)`, longest key first for prefix resolution.
    resource_owner: Vec<(String, String)>,
    /// Winning advertised items, oldest-Healthy backend first.
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
    /// Union of healthy backends' capability objects, served by
    /// `initialize`.
    pub capabilities: Value,
    /// Names of the healthy backends this index was built from.
    pub backends: Vec<String>,
}

impl CapabilityIndex {
    #[must_use]
    pub fn resolve_tool(&self, name: &str) -> Option<&str> {
        self.tool_owner.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn resolve_prompt(&self, name: &str) -> Option<&str> {
        self.prompt_owner.get(name).map(String::as_str)
    }

    /// Longest-prefix match over advertised URIs. A backend advertising a
    /// concrete URI still wins exact lookups: a full match is the longest
    /// possible prefix of itself.
    #[must_use]
    pub fn resolve_resource(&self, uri: &str) -> Option<&str> {
        self.resource_owner
            .iter()
            .find(|(prefix, _)| uri.starts_with(prefix.as_str()))
            .map(|(_, backend)| backend.as_str())
    }

    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tool_owner.len()
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resource_owner.len()
    }

    #[must_use]
    pub fn prompt_count(&self) -> usize {
        self.prompt_owner.len()
    }

    /// Build from a registry snapshot.
    ///
    /// Only `Healthy` backends contribute, ordered by their promotion
    /// sequence (oldest first). On a key collision the earliest backend
    /// wins; later conflicting entries are dropped and counted.
    #[must_use]
    pub fn build(snapshots: &[BackendSnapshot], metrics: &Metrics) -> Self {
        let mut healthy: Vec<&BackendSnapshot> =
            snapshots.iter().filter(|s| s.healthy).collect();
        healthy.sort_by_key(|s| s.initialized_seq.unwrap_or(u64::MAX));

        let mut index = CapabilityIndex {
            capabilities: json!({
                "tools": {},
                "resources": {},
                "prompts": {},
            }),
            ..CapabilityIndex::default()
        };

        for snapshot in healthy {
            index.backends.push(snapshot.name.clone());
            let Some(surface) = snapshot.surface.as_ref() else {
                continue;
            };

            for tool in &surface.tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                if index.tool_owner.contains_key(name) {
                    metrics.incr_capability_conflict();
                    continue;
                }
                index
                    .tool_owner
                    .insert(name.to_string(), snapshot.name.clone());
                index.tools.push(tool.clone());
            }

            for resource in &surface.resources {
                let Some(uri) = resource.get("uri").and_then(Value::as_str) else {
                    continue;
                };
                if index.resource_owner.iter().any(|(key, _)| key == uri) {
                    metrics.incr_capability_conflict();
                    continue;
                }
                index
                    .resource_owner
                    .push((uri.to_string(), snapshot.name.clone()));
                index.resources.push(resource.clone());
            }

            for prompt in &surface.prompts {
                let Some(name) = prompt.get("name").and_then(Value::as_str) else {
                    continue;
                };
                if index.prompt_owner.contains_key(name) {
                    metrics.incr_capability_conflict();
                    continue;
                }
                index
                    .prompt_owner
                    .insert(name.to_string(), snapshot.name.clone());
                index.prompts.push(prompt.clone());
            }

            merge_capability_object(&mut index.capabilities, &surface.server_capabilities);
        }

        // Longest key first so prefix resolution is deterministic.
        index
            .resource_owner
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        index
    }
}

/// Shallow-merge the well-known capability sections, first writer wins per
/// sub-key (same order as the rest of the index build).
fn merge_capability_object(target: &mut Value, source: &Value) {
    let Some(source) = source.as_object() else {
        return;
    };
    let Some(target) = target.as_object_mut() else {
        return;
    };
    for (section, value) in source {
        match (target.get_mut(section), value.as_object()) {
            (Some(Value::Object(existing)), Some(incoming)) => {
                for (k, v) in incoming {
                    existing.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            (Some(_), _) => {}
            (None, _) => {
                target.insert(section.clone(), value.clone());
            }
        }
    }
}

/// Holder of the currently published index.
///
/// Publication swaps the inner `Arc` under a write lock held only for the
/// pointer replacement; readers clone the `Arc` and drop the lock before
/// doing any work, so no reader ever blocks on a rebuild in progress.
pub struct IndexPublisher {
    current: RwLock<Arc<CapabilityIndex>>,
    metrics: Arc<Metrics>,
}

impl IndexPublisher {
    #[must_use]
    pub fn new(metrics: Arc<Metrics>) -> Self {
        // Start from a built-from-nothing index so `initialize` serves a
        // well-shaped capabilities object before the first probe lands.
        let empty = Arc::new(CapabilityIndex::build(&[], &metrics));
        Self {
            current: RwLock::new(empty),
            metrics,
        }
    }

    /// The currently published index.
    #[must_use]
    pub fn load(&self) -> Arc<CapabilityIndex> {
        self.current.read().clone()
    }

    /// Rebuild from `snapshots` and publish atomically.
    pub fn rebuild(&self, snapshots: &[BackendSnapshot]) {
        let next = Arc::new(CapabilityIndex::build(snapshots, &self.metrics));
        tracing::debug!(
            backends = next.backends.len(),
            tools = next.tool_count(),
            resources = next.resource_count(),
            prompts = next.prompt_count(),
            "published capability index"
        );
        *self.current.write() = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendState, CapabilitySurface};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot(
        name: &str,
        healthy: bool,
        seq: u64,
        tools: Vec<Value>,
        resources: Vec<Value>,
        prompts: Vec<Value>,
    ) -> BackendSnapshot {
        BackendSnapshot {
            name: name.to_string(),
            url: format!("http://localhost:{}", 8000 + seq),
            state: if healthy {
                BackendState::Healthy
            } else {
                BackendState::Unhealthy
            },
            healthy,
            last_probe_at: Some(Utc::now()),
            initialized_at: healthy.then(Utc::now),
            consecutive_errors: 0,
            labels: BTreeMap::new(),
            capabilities: Some(json!({"tools": {"listChanged": true}})),
            surface: Some(Arc::new(CapabilitySurface {
                server_capabilities: json!({"tools": {"listChanged": true}}),
                tools,
                resources,
                prompts,
            })),
            initialized_seq: Some(seq),
        }
    }

    #[test]
    fn only_healthy_backends_contribute() {
        let metrics = Metrics::default();
        let index = CapabilityIndex::build(
            &[
                snapshot("up", true, 0, vec![json!({"name": "scrape"})], vec![], vec![]),
                snapshot(
                    "down",
                    false,
                    1,
                    vec![json!({"name": "search"})],
                    vec![],
                    vec![],
                ),
            ],
            &metrics,
        );
        assert_eq!(index.resolve_tool("scrape"), Some("up"));
        assert_eq!(index.resolve_tool("search"), None);
        assert_eq!(index.backends, ["up"]);
        assert_eq!(index.tools.len(), 1);
    }

    #[test]
    fn oldest_healthy_backend_wins_collisions() {
        let metrics = Metrics::default();
        let index = CapabilityIndex::build(
            &[
                // Deliberately out of order: the build must sort by seq.
                snapshot(
                    "late",
                    true,
                    5,
                    vec![json!({"name": "scrape", "description": "late"})],
                    vec![],
                    vec![],
                ),
                snapshot(
                    "early",
                    true,
                    2,
                    vec![json!({"name": "scrape", "description": "early"})],
                    vec![],
                    vec![],
                ),
            ],
            &metrics,
        );
        assert_eq!(index.resolve_tool("scrape"), Some("early"));
        assert_eq!(index.tools.len(), 1);
        assert_eq!(index.tools[0]["description"], json!("early"));
        assert_eq!(metrics.capability_conflicts(), 1);
    }

    #[test]
    fn list_order_follows_promotion_order() {
        let metrics = Metrics::default();
        let index = CapabilityIndex::build(
            &[
                snapshot("b", true, 9, vec![json!({"name": "two"})], vec![], vec![]),
                snapshot("a", true, 1, vec![json!({"name": "one"})], vec![], vec![]),
            ],
            &metrics,
        );
        let names: Vec<&str> = index
            .tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["one", "two"]);
        assert_eq!(index.backends, ["a", "b"]);
    }

    #[test]
    fn resource_resolution_is_longest_prefix_with_exact_fallback() {
        let metrics = Metrics::default();
        let index = CapabilityIndex::build(
            &[
                snapshot(
                    "files",
                    true,
                    0,
                    vec![],
                    vec![json!({"uri": "file:///data/"})],
                    vec![],
                ),
                snapshot(
                    "reports",
                    true,
                    1,
                    vec![],
                    vec![
                        json!({"uri": "file:///data/reports/"}),
                        json!({"uri": "memo://today"}),
                    ],
                    vec![],
                ),
            ],
            &metrics,
        );
        assert_eq!(
            index.resolve_resource("file:///data/reports/q3.csv"),
            Some("reports")
        );
        assert_eq!(index.resolve_resource("file:///data/raw.csv"), Some("files"));
        assert_eq!(index.resolve_resource("memo://today"), Some("reports"));
        assert_eq!(index.resolve_resource("memo://yesterday"), None);
    }

    #[test]
    fn prompt_collisions_are_counted() {
        let metrics = Metrics::default();
        let index = CapabilityIndex::build(
            &[
                snapshot(
                    "a",
                    true,
                    0,
                    vec![],
                    vec![],
                    vec![json!({"name": "summarize"})],
                ),
                snapshot(
                    "b",
                    true,
                    1,
                    vec![],
                    vec![],
                    vec![json!({"name": "summarize"}), json!({"name": "translate"})],
                ),
            ],
            &metrics,
        );
        assert_eq!(index.resolve_prompt("summarize"), Some("a"));
        assert_eq!(index.resolve_prompt("translate"), Some("b"));
        assert_eq!(index.prompts.len(), 2);
        assert_eq!(metrics.capability_conflicts(), 1);
    }

    #[test]
    fn capabilities_union_merges_sections() {
        let metrics = Metrics::default();
        let mut a = snapshot("a", true, 0, vec![], vec![], vec![]);
        a.surface = Some(Arc::new(CapabilitySurface {
            server_capabilities: json!({"tools": {"listChanged": true}}),
            ..CapabilitySurface::default()
        }));
        let mut b = snapshot("b", true, 1, vec![], vec![], vec![]);
        b.surface = Some(Arc::new(CapabilitySurface {
            server_capabilities: json!({"resources": {"subscribe": true}, "experimental": {"x": 1}}),
            ..CapabilitySurface::default()
        }));

        let index = CapabilityIndex::build(&[a, b], &metrics);
        assert_eq!(index.capabilities["tools"]["listChanged"], json!(true));
        assert_eq!(index.capabilities["resources"]["subscribe"], json!(true));
        assert_eq!(index.capabilities["experimental"]["x"], json!(1));
        assert!(index.capabilities["prompts"].is_object());
    }

    #[test]
    fn publisher_swaps_whole_index() {
        let metrics = Arc::new(Metrics::default());
        let publisher = IndexPublisher::new(metrics);
        assert_eq!(publisher.load().tool_count(), 0);

        publisher.rebuild(&[snapshot(
            "a",
            true,
            0,
            vec![json!({"name": "scrape"})],
            vec![],
            vec![],
        )]);
        let published = publisher.load();
        assert_eq!(published.resolve_tool("scrape"), Some("a"));

        // Old handle stays coherent after the next publish.
        publisher.rebuild(&[]);
        assert_eq!(published.resolve_tool("scrape"), Some("a"));
        assert_eq!(publisher.load().tool_count(), 0);
    }
}
