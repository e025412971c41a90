//! Metrics registry, reporters, and the diagnostics endpoint.
//!
//! Registries are cheap atomic counter/gauge tables, one per container and
//! one per task instance. Reporters are a plugin point fed with JSON
//! snapshots on a fixed interval; the diagnostics endpoint serves the same
//! snapshots over HTTP for the lifetime of the process.

pub mod reporter;
pub mod server;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};

pub use reporter::{LogReporter, LogReporterFactory, MetricsReporter, MetricsReporterFactory};
pub use server::DiagnosticsServer;

/// Monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins signed gauge.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Named metrics for one source (the container or one task).
#[derive(Debug)]
pub struct MetricsRegistry {
    source: String,
    counters: Mutex<BTreeMap<String, Counter>>,
    gauges: Mutex<BTreeMap<String, Gauge>>,
}

impl MetricsRegistry {
    pub fn new(source: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            counters: Mutex::new(BTreeMap::new()),
            gauges: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The counter with this name, created on first use.
    pub fn counter(&self, name: &str) -> Counter {
        let mut counters = self.counters.lock().expect("metrics registry poisoned");
        counters.entry(name.to_string()).or_default().clone()
    }

    /// The gauge with this name, created on first use.
    pub fn gauge(&self, name: &str) -> Gauge {
        let mut gauges = self.gauges.lock().expect("metrics registry poisoned");
        gauges.entry(name.to_string()).or_default().clone()
    }

    pub fn snapshot(&self) -> Value {
        let counters: BTreeMap<String, u64> = self
            .counters
            .lock()
            .expect("metrics registry poisoned")
            .iter()
            .map(|(name, counter)| (name.clone(), counter.get()))
            .collect();
        let gauges: BTreeMap<String, i64> = self
            .gauges
            .lock()
            .expect("metrics registry poisoned")
            .iter()
            .map(|(name, gauge)| (name.clone(), gauge.get()))
            .collect();
        json!({
            "source": self.source,
            "at": Utc::now().to_rfc3339(),
            "counters": counters,
            "gauges": gauges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_handles_share_state() {
        let registry = MetricsRegistry::new("test");
        let a = registry.counter("envelopes");
        let b = registry.counter("envelopes");
        a.inc();
        b.add(2);
        assert_eq!(registry.counter("envelopes").get(), 3);
    }

    #[test]
    fn test_snapshot_shape() {
        let registry = MetricsRegistry::new("partition-0");
        registry.counter("commits").add(5);
        registry.gauge("buffered").set(-1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["source"], "partition-0");
        assert_eq!(snapshot["counters"]["commits"], 5);
        assert_eq!(snapshot["gauges"]["buffered"], -1);
    }
}
