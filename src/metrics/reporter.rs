//! Metrics reporter plugin point.

use std::sync::Arc;

use serde_json::Value;

use crate::types::{Config, Result};

/// Receives registry snapshots on the configured interval and once more at
/// shutdown. Implementations must not block the caller for long; slow sinks
/// should buffer internally.
pub trait MetricsReporter: Send + Sync {
    fn report(&self, snapshots: &[Value]);
}

pub trait MetricsReporterFactory: Send + Sync {
    fn make(&self, name: &str, config: &Config) -> Result<Arc<dyn MetricsReporter>>;
}

/// Built-in reporter that emits snapshots through `tracing`.
pub struct LogReporter;

impl MetricsReporter for LogReporter {
    fn report(&self, snapshots: &[Value]) {
        for snapshot in snapshots {
            let source = snapshot
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            tracing::info!(target: "metrics", source, snapshot = %snapshot, "metrics snapshot");
        }
    }
}

pub struct LogReporterFactory;

impl MetricsReporterFactory for LogReporterFactory {
    fn make(&self, _name: &str, _config: &Config) -> Result<Arc<dyn MetricsReporter>> {
        Ok(Arc::new(LogReporter))
    }
}
