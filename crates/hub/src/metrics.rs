//! Lock-free observability counters, surfaced on `/status`.

use crate::error::ErrorKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Metrics {
    capability_conflicts_total: AtomicU64,
    dropped_notifications_total: AtomicU64,
    errors_total: [AtomicU64; ErrorKind::ALL.len()],
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            capability_conflicts_total: AtomicU64::new(0),
            dropped_notifications_total: AtomicU64::new(0),
            errors_total: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Metrics {
    pub fn incr_capability_conflict(&self) {
        self.capability_conflicts_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_notification(&self) {
        self.dropped_notifications_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_error(&self, kind: ErrorKind) {
        self.errors_total[kind_slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn capability_conflicts(&self) -> u64 {
        self.capability_conflicts_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            capability_conflicts_total: self.capability_conflicts(),
            dropped_notifications_total: self.dropped_notifications(),
            errors_total: ErrorKind::ALL
                .iter()
                .map(|kind| {
                    (
                        kind.label().to_string(),
                        self.errors_total[kind_slot(*kind)].load(Ordering::Relaxed),
                    )
                })
                .filter(|(_, count)| *count > 0)
                .collect(),
        }
    }
}

fn kind_slot(kind: ErrorKind) -> usize {
    ErrorKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub capability_conflicts_total: u64,
    pub dropped_notifications_total: u64,
    pub errors_total: BTreeMap<String, u64>,
}
