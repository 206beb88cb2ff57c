// =============================================================================
// Metrics registry — named counters and gauges per pipeline instance
// =============================================================================
//
// Counters are append-only and keyed by flat names with an inline label
// suffix, e.g. `aggregator.emitted_total{tf=H1}`. The map sits behind a
// parking_lot RwLock so an external observer can snapshot while the driver
// writes; observed values are eventually consistent, never part of the
// deterministic event log.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, u64>>,
    gauges: RwLock<BTreeMap<String, u64>>,
}

/// Point-in-time copy of every counter and gauge.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `name` by one.
    pub fn inc(&self, name: &str) {
        self.inc_by(name, 1);
    }

    pub fn inc_by(&self, name: &str, delta: u64) {
        *self.counters.write().entry(name.to_string()).or_insert(0) += delta;
    }

    /// Increment a counter with one `{key=value}` label.
    pub fn inc_labeled(&self, name: &str, key: &str, value: impl std::fmt::Display) {
        self.inc_by(&format!("{name}{{{key}={value}}}"), 1);
    }

    /// Record a gauge (last-write-wins), e.g. per-stage latency.
    pub fn set_gauge(&self, name: &str, value: u64) {
        self.gauges.write().insert(name.to_string(), value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().clone(),
            gauges: self.gauges.read().clone(),
        }
    }
}
