//! The user-task contract and its per-task surroundings.
//!
//! A [`StreamTask`] is the user-supplied logic, instantiated once per owned
//! partition. It talks back to the container through the [`TaskContext`]
//! (stores, metrics, and the outbound collector) and the per-iteration
//! [`Coordinator`] (commit and shutdown requests).

pub mod instance;

use async_trait::async_trait;

use crate::envelope::{IncomingMessageEnvelope, OutgoingMessageEnvelope};
use crate::metrics::MetricsRegistry;
use crate::storage::{LoggedStore, TaskStorageManager};
use crate::types::{Config, Error, Partition, Result, TaskName};

pub use instance::TaskInstance;

/// Per-iteration signal object. Created at the top of every run-loop
/// iteration and discarded at the bottom; it never outlives one.
#[derive(Debug, Default)]
pub struct Coordinator {
    commit_requested: bool,
    shutdown_requested: bool,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a commit this iteration, regardless of the commit interval.
    pub fn request_commit(&mut self) {
        self.commit_requested = true;
    }

    /// Ask the container to stop. Honored at the end of the iteration,
    /// after send and commit have run.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn commit_requested(&self) -> bool {
        self.commit_requested
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }
}

/// What one task sees of the container: its stores, its metrics, and the
/// collector its outbound envelopes accumulate into. Owned exclusively by
/// one [`TaskInstance`]; never shared.
pub struct TaskContext {
    task_name: TaskName,
    partition: Partition,
    metrics: std::sync::Arc<MetricsRegistry>,
    storage: TaskStorageManager,
    collector: Vec<OutgoingMessageEnvelope>,
}

impl TaskContext {
    pub fn new(
        task_name: TaskName,
        partition: Partition,
        metrics: std::sync::Arc<MetricsRegistry>,
        storage: TaskStorageManager,
    ) -> Self {
        Self {
            task_name,
            partition,
            metrics,
            storage,
            collector: Vec::new(),
        }
    }

    pub fn task_name(&self) -> &TaskName {
        &self.task_name
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Queue an outbound envelope. Envelopes are delivered to the producers
    /// in queue order during the iteration's send phase.
    pub fn send(&mut self, envelope: OutgoingMessageEnvelope) {
        self.collector.push(envelope);
    }

    pub fn store(&mut self, name: &str) -> Result<&mut LoggedStore> {
        self.storage
            .store_mut(name)
            .ok_or_else(|| Error::setup(format!("task has no store named '{}'", name)))
    }

    pub(crate) fn storage_mut(&mut self) -> &mut TaskStorageManager {
        &mut self.storage
    }

    /// Drain the collector, keeping its allocation for the next iteration.
    pub(crate) fn drain_collector(&mut self) -> Vec<OutgoingMessageEnvelope> {
        self.collector.drain(..).collect()
    }
}

/// User-supplied task logic. One instance per owned partition; all calls
/// arrive on the container's single data-path thread.
#[async_trait(?Send)]
pub trait StreamTask {
    /// Called once after stores are restored, before any envelope.
    async fn init(&mut self, _ctx: &mut TaskContext) -> Result<()> {
        Ok(())
    }

    /// Handle one envelope of one of this task's input partitions.
    async fn process(
        &mut self,
        envelope: &IncomingMessageEnvelope,
        ctx: &mut TaskContext,
        coordinator: &mut Coordinator,
    ) -> Result<()>;

    /// Called on the configured window interval, input or not.
    async fn window(&mut self, _ctx: &mut TaskContext, _coordinator: &mut Coordinator) -> Result<()> {
        Ok(())
    }

    /// Called once during shutdown.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait StreamTaskFactory: Send + Sync {
    fn make(&self, config: &Config) -> Result<Box<dyn StreamTask>>;
}

/// Observes task lifecycle transitions. All hooks default to no-ops.
pub trait TaskLifecycleListener {
    fn before_init(&mut self, _task: &TaskName) {}
    fn after_init(&mut self, _task: &TaskName) {}
    fn before_process(&mut self, _task: &TaskName, _envelope: &IncomingMessageEnvelope) {}
    fn after_process(&mut self, _task: &TaskName, _envelope: &IncomingMessageEnvelope) {}
    fn before_close(&mut self, _task: &TaskName) {}
    /// Observes user-code failures before they propagate.
    fn on_failure(&mut self, _task: &TaskName, _error: &Error) {}
}

pub trait TaskLifecycleListenerFactory: Send + Sync {
    fn make(&self, name: &str, config: &Config) -> Result<Box<dyn TaskLifecycleListener>>;
}
