//! Canonical backend store.
//!
//! The registry exclusively owns every backend record. Mutations go through
//! the methods below under a single mutex with short, non-suspending
//! critical sections; readers get cloned snapshots and never hold the lock
//! across their own work.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// State of a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Discovered but never probed.
    Unknown,
    /// First probe in flight.
    Probing,
    /// Probes succeed; capabilities are published.
    Healthy,
    /// Probes fail; capabilities are withheld.
    Unhealthy,
    /// Dropped from the compose set; treated as absent.
    Removed,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Unknown => write!(f, "unknown"),
            BackendState::Probing => write!(f, "probing"),
            BackendState::Healthy => write!(f, "healthy"),
            BackendState::Unhealthy => write!(f, "unhealthy"),
            BackendState::Removed => write!(f, "removed"),
        }
    }
}

/// The capability surface a backend advertised during its last refresh.
///
/// Items are opaque JSON objects from the backend; only the `name`/`uri`
/// keys are ever read, by the index builder.
#[derive(Debug, Default)]
pub struct CapabilitySurface {
    /// Raw `capabilities` object from `initialize`.
    pub server_capabilities: Value,
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
}

/// A state transition observed by a registry mutation, for logging and
/// index-refresh decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BackendState,
    pub to: BackendState,
}

#[derive(Debug)]
struct BackendRecord {
    name: String,
    base_url: String,
    labels: BTreeMap<String, String>,
    state: BackendState,
    last_probe_at: Option<DateTime<Utc>>,
    consecutive_errors: u32,
    surface: Option<Arc<CapabilitySurface>>,
    initialized_at: Option<DateTime<Utc>>,
    /// Monotonic order of transitions into `Healthy`; breaks wall-clock ties
    /// for the oldest-wins collision rule.
    initialized_seq: Option<u64>,
}

/// Immutable view of one backend, as served by `/servers` and consumed by
/// the index builder.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub url: String,
    pub state: BackendState,
    pub healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub initialized_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Raw MCP capabilities object from the backend's last `initialize`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(skip)]
    pub surface: Option<Arc<CapabilitySurface>>,
    #[serde(skip)]
    pub initialized_seq: Option<u64>,
}

/// Outcome of an [`Registry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The base URL changed; state was reset to `Unknown`.
    Reset,
    Unchanged,
}

struct RegistryInner {
    backends: HashMap<String, BackendRecord>,
    next_initialized_seq: u64,
}

/// Single-writer, many-reader store of backends.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    fail_threshold: u32,
}

impl Registry {
    #[must_use]
    pub fn new(fail_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                backends: HashMap::new(),
                next_initialized_seq: 0,
            }),
            fail_threshold: fail_threshold.max(1),
        }
    }

    /// Insert or update a backend.
    ///
    /// A base-URL change invalidates everything learned about the backend:
    /// state returns to `Unknown`, counters and capabilities are cleared.
    pub fn upsert(
        &self,
        name: &str,
        base_url: &str,
        labels: BTreeMap<String, String>,
    ) -> UpsertOutcome {
        let mut inner = self.inner.lock();
        match inner.backends.get_mut(name) {
            Some(record) if record.state != BackendState::Removed => {
                record.labels = labels;
                if record.base_url == base_url {
                    return UpsertOutcome::Unchanged;
                }
                record.base_url = base_url.to_string();
                record.state = BackendState::Unknown;
                record.consecutive_errors = 0;
                record.surface = None;
                record.initialized_at = None;
                record.initialized_seq = None;
                UpsertOutcome::Reset
            }
            _ => {
                inner.backends.insert(
                    name.to_string(),
                    BackendRecord {
                        name: name.to_string(),
                        base_url: base_url.to_string(),
                        labels,
                        state: BackendState::Unknown,
                        last_probe_at: None,
                        consecutive_errors: 0,
                        surface: None,
                        initialized_at: None,
                        initialized_seq: None,
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Record a probe start. Only `Unknown` moves to `Probing`; later probes
    /// leave the settled state in place.
    pub fn mark_probing(&self, name: &str) -> Option<Transition> {
        let mut inner = self.inner.lock();
        let record = live_record(&mut inner, name)?;
        record.last_probe_at = Some(Utc::now());
        if record.state == BackendState::Unknown {
            record.state = BackendState::Probing;
            Some(Transition {
                from: BackendState::Unknown,
                to: BackendState::Probing,
            })
        } else {
            None
        }
    }

    /// Record a successful probe.
    ///
    /// `surface: Some(..)` replaces the advertised capabilities (a promotion
    /// with a fresh refresh); `None` keeps the existing ones (steady-state
    /// success). Either way the error counter resets.
    pub fn mark_healthy(
        &self,
        name: &str,
        surface: Option<Arc<CapabilitySurface>>,
    ) -> Option<Transition> {
        let mut inner = self.inner.lock();
        let record = inner
            .backends
            .get(name)
            .filter(|r| r.state != BackendState::Removed)?;
        let from = record.state;
        let promote = from != BackendState::Healthy;
        let seq = promote.then(|| {
            let seq = inner.next_initialized_seq;
            inner.next_initialized_seq += 1;
            seq
        });

        let record = inner.backends.get_mut(name)?;
        record.state = BackendState::Healthy;
        record.last_probe_at = Some(Utc::now());
        record.consecutive_errors = 0;
        if let Some(surface) = surface {
            record.surface = Some(surface);
        }
        if let Some(seq) = seq {
            record.initialized_at = Some(Utc::now());
            record.initialized_seq = Some(seq);
        }

        Some(Transition {
            from,
            to: BackendState::Healthy,
        })
    }

    /// Record a failed probe.
    ///
    /// A `Healthy` backend rides out failures below the configured
    /// threshold; everything else settles into `Unhealthy` immediately.
    pub fn mark_unhealthy(&self, name: &str) -> Option<Transition> {
        let mut inner = self.inner.lock();
        let record = live_record(&mut inner, name)?;
        let from = record.state;
        record.last_probe_at = Some(Utc::now());
        record.consecutive_errors = record.consecutive_errors.saturating_add(1);

        let to = match from {
            BackendState::Healthy if record.consecutive_errors < self.fail_threshold => {
                BackendState::Healthy
            }
            _ => BackendState::Unhealthy,
        };
        record.state = to;
        Some(Transition { from, to })
    }

    /// Transition to `Removed`. Subsequent accessors treat the backend as
    /// absent; the record is evicted.
    pub fn remove(&self, name: &str) -> Option<Transition> {
        let mut inner = self.inner.lock();
        let record = inner.backends.remove(name)?;
        Some(Transition {
            from: record.state,
            to: BackendState::Removed,
        })
    }

    /// Point lookup.
    pub fn get(&self, name: &str) -> Option<BackendSnapshot> {
        let inner = self.inner.lock();
        inner
            .backends
            .get(name)
            .filter(|r| r.state != BackendState::Removed)
            .map(snapshot_of)
    }

    /// Consistent copy of all live backends, sorted by name.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let inner = self.inner.lock();
        let mut snapshots: Vec<BackendSnapshot> = inner
            .backends
            .values()
            .filter(|r| r.state != BackendState::Removed)
            .map(snapshot_of)
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Names of all live backends.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .backends
            .values()
            .filter(|r| r.state != BackendState::Removed)
            .map(|r| r.name.clone())
            .collect()
    }
}

fn live_record<'a>(inner: &'a mut RegistryInner, name: &str) -> Option<&'a mut BackendRecord> {
    inner
        .backends
        .get_mut(name)
        .filter(|r| r.state != BackendState::Removed)
}

fn snapshot_of(record: &BackendRecord) -> BackendSnapshot {
    BackendSnapshot {
        name: record.name.clone(),
        url: record.base_url.clone(),
        state: record.state,
        healthy: record.state == BackendState::Healthy,
        last_probe_at: record.last_probe_at,
        initialized_at: record.initialized_at,
        consecutive_errors: record.consecutive_errors,
        labels: record.labels.clone(),
        capabilities: record
            .surface
            .as_ref()
            .map(|s| s.server_capabilities.clone()),
        surface: record.surface.clone(),
        initialized_seq: record.initialized_seq,
    }
}
