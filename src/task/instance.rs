//! One partition's task binding.
//!
//! A [`TaskInstance`] couples the user task with everything that partition
//! owns: its context (stores, collector, metrics), its input partitions and
//! their offsets, its lifecycle listeners, and the gating state for window
//! and commit intervals. All calls arrive from the container's run loop.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::envelope::IncomingMessageEnvelope;
use crate::metrics::Counter;
use crate::registry::FactoryRegistry;
use crate::system::{SharedProducers, StartingOffset, SystemConsumers};
use crate::task::{Coordinator, StreamTask, TaskContext, TaskLifecycleListener};
use crate::types::{
    Config, Error, OffsetReset, Partition, Result, StreamConfig, SystemStreamPartition, TaskName,
};
use crate::util::with_recovery_async;

pub struct TaskInstance {
    task: Box<dyn StreamTask>,
    ctx: TaskContext,
    input_ssps: BTreeSet<SystemStreamPartition>,
    /// Last processed offset per input partition; what a commit checkpoints.
    offsets: BTreeMap<SystemStreamPartition, crate::types::Offset>,
    listeners: Vec<Box<dyn TaskLifecycleListener>>,
    producers: SharedProducers,
    window_ms: i64,
    commit_ms: i64,
    last_window: Instant,
    last_commit: Instant,
    processed: Counter,
    windows: Counter,
    commits: Counter,
    commit_failures: Counter,
    sent: Counter,
}

impl TaskInstance {
    pub fn new(
        task: Box<dyn StreamTask>,
        ctx: TaskContext,
        input_ssps: BTreeSet<SystemStreamPartition>,
        listeners: Vec<Box<dyn TaskLifecycleListener>>,
        producers: SharedProducers,
        window_ms: i64,
        commit_ms: i64,
    ) -> Self {
        let processed = ctx.metrics().counter("task.envelopes-processed");
        let windows = ctx.metrics().counter("task.windows");
        let commits = ctx.metrics().counter("task.commits");
        let commit_failures = ctx.metrics().counter("task.commit-failures");
        let sent = ctx.metrics().counter("task.envelopes-sent");
        Self {
            task,
            ctx,
            input_ssps,
            offsets: BTreeMap::new(),
            listeners,
            producers,
            window_ms,
            commit_ms,
            last_window: Instant::now(),
            last_commit: Instant::now(),
            processed,
            windows,
            commits,
            commit_failures,
            sent,
        }
    }

    pub fn task_name(&self) -> &TaskName {
        self.ctx.task_name()
    }

    pub fn partition(&self) -> Partition {
        self.ctx.partition()
    }

    pub fn owns(&self, ssp: &SystemStreamPartition) -> bool {
        self.input_ssps.contains(ssp)
    }

    /// Register this task's input partitions with the consumer multiplexer.
    ///
    /// Starting offsets come from the checkpoint when one exists and the
    /// stream's `reset.offset` flag is off, else from the stream's reset
    /// policy. Checkpointed offsets also seed the in-memory offset table so
    /// an early commit never regresses a previous checkpoint.
    pub fn register_consumers(
        &mut self,
        consumers: &mut SystemConsumers,
        checkpoint: Option<&Checkpoint>,
        config: &Config,
    ) -> Result<()> {
        let stream_config = StreamConfig::new(config);
        for ssp in self.input_ssps.clone() {
            let reset = stream_config.reset_offset(&ssp.system_stream)?;
            let checkpointed = (!reset)
                .then(|| checkpoint.and_then(|c| c.offset(&ssp)).cloned())
                .flatten();

            let start = match checkpointed {
                Some(offset) => {
                    self.offsets.insert(ssp.clone(), offset.clone());
                    StartingOffset::Resume(offset)
                }
                None => match stream_config.offset_default(&ssp.system_stream)? {
                    OffsetReset::Earliest => StartingOffset::Earliest,
                    OffsetReset::Latest => StartingOffset::Latest,
                },
            };
            tracing::debug!(task = %self.task_name(), ssp = %ssp, start = ?start, "registering input");
            consumers.register(ssp, start)?;
        }
        Ok(())
    }

    /// Register this task as a producer source.
    pub fn register_producers(&mut self) {
        self.producers.register(self.ctx.task_name().as_str());
    }

    /// Tell the checkpoint backend to track this task.
    pub fn register_checkpoints(&self, manager: &mut dyn CheckpointManager) {
        manager.register(self.ctx.task_name());
    }

    /// Restore every changelog-backed store; must complete before `init`.
    pub async fn start_stores(&mut self, config: &Config, registry: &FactoryRegistry) -> Result<()> {
        self.ctx.storage_mut().restore_all(config, registry).await
    }

    /// Run the user `init` hook between the listeners' before/after hooks.
    pub async fn init_task(&mut self) -> Result<()> {
        for listener in &mut self.listeners {
            listener.before_init(self.ctx.task_name());
        }
        with_recovery_async(self.task.init(&mut self.ctx), "init").await?;
        for listener in &mut self.listeners {
            listener.after_init(self.ctx.task_name());
        }
        Ok(())
    }

    /// Feed one envelope to the user task. The observed offset advances only
    /// after a successful return; failures reach the listeners and then
    /// propagate (processing errors are fatal by default).
    pub async fn process(
        &mut self,
        envelope: IncomingMessageEnvelope,
        coordinator: &mut Coordinator,
    ) -> Result<()> {
        debug_assert!(self.owns(&envelope.ssp), "envelope routed to wrong task");
        for listener in &mut self.listeners {
            listener.before_process(self.ctx.task_name(), &envelope);
        }

        let result =
            with_recovery_async(self.task.process(&envelope, &mut self.ctx, coordinator), "process")
                .await;
        if let Err(error) = result {
            for listener in &mut self.listeners {
                listener.on_failure(self.ctx.task_name(), &error);
            }
            return Err(error);
        }

        self.offsets.insert(envelope.ssp.clone(), envelope.offset.clone());
        self.processed.inc();
        for listener in &mut self.listeners {
            listener.after_process(self.ctx.task_name(), &envelope);
        }
        Ok(())
    }

    /// Run the user `window` hook when windowing is enabled and the interval
    /// has elapsed.
    pub async fn window_if_due(&mut self, coordinator: &mut Coordinator) -> Result<()> {
        if self.window_ms < 0 {
            return Ok(());
        }
        if self.last_window.elapsed() < Duration::from_millis(self.window_ms as u64) {
            return Ok(());
        }
        self.last_window = Instant::now();
        let result =
            with_recovery_async(self.task.window(&mut self.ctx, coordinator), "window").await;
        if let Err(error) = result {
            for listener in &mut self.listeners {
                listener.on_failure(self.ctx.task_name(), &error);
            }
            return Err(error);
        }
        self.windows.inc();
        Ok(())
    }

    /// Drain the collector into the producer multiplexer, in queue order.
    pub async fn send(&mut self) -> Result<()> {
        let outgoing = self.ctx.drain_collector();
        for envelope in outgoing {
            self.producers
                .send(self.ctx.task_name().as_str(), envelope)
                .await?;
            self.sent.inc();
        }
        Ok(())
    }

    /// Commit when the interval has elapsed or the coordinator asked for
    /// one. A failed commit is logged and retried by a later iteration;
    /// the checkpoint is simply not written this time.
    pub async fn commit_if_due(
        &mut self,
        coordinator: &Coordinator,
        manager: Option<&mut (dyn CheckpointManager + 'static)>,
    ) -> Result<()> {
        let interval_due = self.commit_ms >= 0
            && self.last_commit.elapsed() >= Duration::from_millis(self.commit_ms as u64);
        if !interval_due && !coordinator.commit_requested() {
            return Ok(());
        }
        self.last_commit = Instant::now();
        match self.commit(manager).await {
            Ok(()) => {
                self.commits.inc();
                Ok(())
            }
            Err(error) => {
                self.commit_failures.inc();
                tracing::warn!(task = %self.task_name(), error = %error, "commit failed, will retry");
                Ok(())
            }
        }
    }

    /// The commit protocol: flush stores, flush producers, then write the
    /// checkpoint. The checkpoint is written last so a failure at any
    /// earlier step leaves the previous checkpoint authoritative.
    async fn commit(&mut self, manager: Option<&mut (dyn CheckpointManager + 'static)>) -> Result<()> {
        self.ctx.storage_mut().flush_all()?;
        self.producers
            .flush(self.ctx.task_name().as_str())
            .await
            .map_err(|e| Error::commit(format!("producer flush failed: {}", e)))?;

        if let Some(manager) = manager {
            if !self.offsets.is_empty() {
                let checkpoint = Checkpoint::new(self.offsets.clone());
                manager
                    .write(self.ctx.task_name(), &checkpoint)
                    .map_err(|e| Error::commit(format!("checkpoint write failed: {}", e)))?;
            }
        }
        Ok(())
    }

    /// Run the user `close` hook. Shutdown path: errors are logged, not
    /// propagated.
    pub async fn close(&mut self) {
        for listener in &mut self.listeners {
            listener.before_close(self.ctx.task_name());
        }
        if let Err(error) = with_recovery_async(self.task.close(), "close").await {
            tracing::error!(task = %self.task_name(), error = %error, "task close failed");
        }
    }

    /// Stop every store. Shutdown path: errors are logged inside.
    pub fn stop_stores(&mut self) {
        self.ctx.storage_mut().stop_all();
    }
}
