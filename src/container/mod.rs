//! The container — wiring and the run loop.
//!
//! The container owns every subsystem and is the single actor on the data
//! path: one thread runs the loop, all task code, all store mutations, and
//! all commits. Subsystems start in a fixed order (metrics → checkpoints →
//! stores with restore → task init → producers → consumers) and stop in
//! strict reverse order, once each, even when the loop exits with an error.
//!
//! ```text
//!   loop:
//!     coordinator = new
//!     process   — at most one envelope via SystemConsumers::choose
//!     window    — per task, interval-gated
//!     send      — drain every task's collector into the producers
//!     commit    — per task, interval- or request-gated
//!     break when shutdown was requested (after send + commit ran)
//! ```

mod signals;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::codec::SerdeManager;
use crate::metrics::{Counter, DiagnosticsServer, MetricsRegistry, MetricsReporter};
use crate::registry::FactoryRegistry;
use crate::system::{
    SharedProducers, SystemConsumer, SystemConsumers, SystemConsumersOptions, SystemProducer,
    SystemProducers,
};
use crate::task::{Coordinator, TaskContext, TaskInstance};
use crate::types::{
    Config, ContainerConfig, Error, MetricsConfig, Partition, Result, StoreConfig, StreamConfig,
    SystemConfig, TaskConfig, TaskName,
};

/// Which subsystems have been started, so shutdown stops exactly those.
#[derive(Debug, Default)]
struct StartedFlags {
    metrics: bool,
    checkpoints: bool,
    stores: bool,
    tasks: bool,
    producers: bool,
    consumers: bool,
}

pub struct Container {
    name: String,
    run_id: String,
    config: Config,
    registry: FactoryRegistry,
    tasks: Vec<TaskInstance>,
    consumers: SystemConsumers,
    producers: SharedProducers,
    checkpoints: Option<Box<dyn CheckpointManager>>,
    registries: Vec<Arc<MetricsRegistry>>,
    reporters: Vec<Arc<dyn MetricsReporter>>,
    reporter_interval: Duration,
    reporter_task: Option<(CancellationToken, JoinHandle<()>)>,
    diagnostics_port: Option<u16>,
    diagnostics: Option<DiagnosticsServer>,
    shutdown: CancellationToken,
    iterations: Counter,
    started: StartedFlags,
}

impl Container {
    /// Wire every subsystem from config. Any missing key, unknown factory,
    /// or failed construction is fatal here, before anything starts.
    pub fn from_config(
        name: String,
        partitions: Vec<Partition>,
        config: Config,
        registry: FactoryRegistry,
    ) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::config("PARTITION_IDS", "at least one partition required"));
        }
        let partitions: BTreeSet<Partition> = partitions.into_iter().collect();

        let task_config = TaskConfig::new(&config);
        let system_config = SystemConfig::new(&config);
        let store_config = StoreConfig::new(&config);
        let container_config = ContainerConfig::new(&config);
        let metrics_config = MetricsConfig::new(&config);

        let inputs = task_config.inputs()?;
        let window_ms = task_config.window_ms()?;
        let commit_ms = task_config.commit_ms()?;

        let container_metrics = MetricsRegistry::new(name.clone());
        let iterations = container_metrics.counter("container.iterations");

        // Codec bindings: system-level, stream-level, and the changelog set.
        let mut serdes = SerdeManager::new();
        for system in system_config.system_names() {
            let key = system_config
                .key_serde(&system)
                .map(|n| registry.make_serde(n, &config))
                .transpose()?;
            let msg = system_config
                .msg_serde(&system)
                .map(|n| registry.make_serde(n, &config))
                .transpose()?;
            serdes.bind_system(system, key, msg);
        }
        let stream_config = StreamConfig::new(&config);
        for stream in stream_config.streams_with_serde_overrides() {
            let key = stream_config
                .key_serde(&stream)
                .map(|n| registry.make_serde(n, &config))
                .transpose()?;
            let msg = stream_config
                .msg_serde(&stream)
                .map(|n| registry.make_serde(n, &config))
                .transpose()?;
            serdes.bind_stream(stream, key, msg);
        }
        for store in store_config.store_names() {
            if let Some(changelog) = store_config.changelog(&store)? {
                serdes.register_changelog(changelog);
            }
        }
        let serdes = Arc::new(serdes);

        // Consumers: one per system referenced by the inputs.
        let input_systems: BTreeSet<&str> = inputs.iter().map(|ss| ss.system.as_str()).collect();
        let mut consumer_map: HashMap<String, Box<dyn SystemConsumer>> = HashMap::new();
        for system in &input_systems {
            let key = SystemConfig::factory_key(system);
            let factory = registry.system_factory(&key, system_config.factory(system)?)?;
            let consumer = factory.consumer(system, &config).map_err(|e| {
                Error::setup(format!("failed to construct consumer for system '{}': {}", system, e))
            })?;
            consumer_map.insert(system.to_string(), consumer);
        }

        let chooser = registry
            .chooser_factory(TaskConfig::CHOOSER_FACTORY, task_config.chooser_factory())?
            .make(&config)?;
        let consumers = SystemConsumers::new(
            consumer_map,
            chooser,
            Arc::clone(&serdes),
            SystemConsumersOptions {
                poll_timeout: container_config.poll_timeout()?,
                high_watermark: container_config.queue_high_watermark()?,
                low_watermark: container_config.queue_low_watermark()?,
                drop_deserialization_errors: task_config.drop_deserialization_errors()?,
            },
            &container_metrics,
        );

        // Producers: one per system declared in config, so tasks can write
        // to any of them.
        let mut producer_map: HashMap<String, Box<dyn SystemProducer>> = HashMap::new();
        for system in system_config.system_names() {
            let key = SystemConfig::factory_key(&system);
            let factory = registry.system_factory(&key, system_config.factory(&system)?)?;
            let producer = factory.producer(&system, &config).map_err(|e| {
                Error::setup(format!("failed to construct producer for system '{}': {}", system, e))
            })?;
            producer_map.insert(system, producer);
        }
        let producers = SharedProducers::new(SystemProducers::new(
            producer_map,
            Arc::clone(&serdes),
            &container_metrics,
        ));

        // Checkpointing is an optional capability.
        let checkpoints = match task_config.checkpoint_factory() {
            Some(factory_name) => Some(
                registry
                    .checkpoint_factory(TaskConfig::CHECKPOINT_FACTORY, factory_name)?
                    .make(&config)?,
            ),
            None => None,
        };

        // Reporters.
        let mut reporters = Vec::new();
        for reporter_name in metrics_config.reporters() {
            let key = format!("metrics.reporter.{}.factory", reporter_name);
            let factory =
                registry.reporter_factory(&key, metrics_config.reporter_factory(&reporter_name)?)?;
            reporters.push(factory.make(&reporter_name, &config)?);
        }

        // One task instance per assigned partition.
        let mut registries = vec![Arc::clone(&container_metrics)];
        let mut tasks = Vec::new();
        for partition in partitions {
            let task_name = TaskName::for_partition(partition);
            let task_metrics = MetricsRegistry::new(task_name.as_str());
            registries.push(Arc::clone(&task_metrics));

            let mut stores = HashMap::new();
            for store in store_config.store_names() {
                let key = format!("stores.{}.factory", store);
                let factory = registry.store_factory(&key, store_config.factory(&store)?)?;
                let store_dir = container_config
                    .state_dir()
                    .join(&store)
                    .join(partition.to_string());
                std::fs::create_dir_all(&store_dir)?;
                let engine = factory.make(&store, partition, &store_dir, &config)?;

                let key_serde = store_config
                    .key_serde(&store)
                    .map(|n| registry.make_serde(n, &config))
                    .transpose()?;
                let msg_serde = store_config
                    .msg_serde(&store)
                    .map(|n| registry.make_serde(n, &config))
                    .transpose()?;
                let changelog = store_config
                    .changelog(&store)?
                    .map(|ss| ss.partition(partition));

                stores.insert(
                    store.clone(),
                    crate::storage::LoggedStore::new(
                        store.clone(),
                        engine,
                        key_serde,
                        msg_serde,
                        changelog,
                        producers.clone(),
                        task_name.as_str(),
                    ),
                );
            }
            let storage =
                crate::storage::TaskStorageManager::new(task_name.clone(), partition, stores);

            let mut listeners = Vec::new();
            for listener_name in task_config.lifecycle_listeners() {
                let key = format!("task.lifecycle.listener.{}.factory", listener_name);
                let factory = registry
                    .listener_factory(&key, task_config.listener_factory(&listener_name)?)?;
                listeners.push(factory.make(&listener_name, &config)?);
            }

            let task = registry
                .task_factory(TaskConfig::FACTORY, task_config.task_factory()?)?
                .make(&config)?;

            let input_ssps: BTreeSet<_> =
                inputs.iter().map(|ss| ss.partition(partition)).collect();
            let ctx = TaskContext::new(task_name, partition, task_metrics, storage);
            tasks.push(TaskInstance::new(
                task,
                ctx,
                input_ssps,
                listeners,
                producers.clone(),
                window_ms,
                commit_ms,
            ));
        }

        let reporter_interval = metrics_config.interval()?;
        let diagnostics_port = container_config.diagnostics_port()?;

        Ok(Self {
            name,
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            config,
            registry,
            tasks,
            consumers,
            producers,
            checkpoints,
            registries,
            reporters,
            reporter_interval,
            reporter_task: None,
            diagnostics_port,
            diagnostics: None,
            shutdown: CancellationToken::new(),
            iterations,
            started: StartedFlags::default(),
        })
    }

    /// A token that stops the run loop at the end of its current iteration.
    /// Wired to the OS signals in `run`; tests cancel it directly.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start everything, run the loop, then stop everything — the stop
    /// sequence runs no matter how the loop exits.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            container = %self.name,
            run_id = %self.run_id,
            tasks = self.tasks.len(),
            "container starting"
        );
        signals::cancel_on_termination(self.shutdown.clone());

        let result = self.start_and_loop().await;
        if let Err(error) = &result {
            tracing::error!(error = %error, "container failed, running shutdown sequence");
        }
        self.shutdown_subsystems().await;
        tracing::info!(container = %self.name, "container stopped");
        result
    }

    async fn start_and_loop(&mut self) -> Result<()> {
        self.started.metrics = true;
        self.start_metrics().await?;

        if let Some(manager) = self.checkpoints.as_deref_mut() {
            self.started.checkpoints = true;
            manager.start()?;
            for task in &self.tasks {
                task.register_checkpoints(manager);
            }
        }

        self.started.stores = true;
        for task in &mut self.tasks {
            task.start_stores(&self.config, &self.registry).await?;
        }

        self.started.tasks = true;
        for task in &mut self.tasks {
            task.init_task().await?;
        }

        self.started.producers = true;
        for task in &mut self.tasks {
            task.register_producers();
        }
        self.producers.start().await?;

        self.started.consumers = true;
        for task in &mut self.tasks {
            let checkpoint = match self.checkpoints.as_deref_mut() {
                Some(manager) => manager.read_last(task.task_name())?,
                None => None,
            };
            task.register_consumers(&mut self.consumers, checkpoint.as_ref(), &self.config)?;
        }
        self.consumers.start().await?;

        tracing::info!(container = %self.name, "container running");
        self.run_loop().await
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let mut coordinator = Coordinator::new();

            // process: at most one envelope per iteration. A null choose
            // still runs window/send/commit so timers stay live under idle
            // input.
            if let Some(envelope) = self.consumers.choose().await? {
                match self.tasks.iter_mut().find(|t| t.owns(&envelope.ssp)) {
                    Some(task) => task.process(envelope, &mut coordinator).await?,
                    None => tracing::warn!(ssp = %envelope.ssp, "no task owns partition"),
                }
            }

            for task in &mut self.tasks {
                task.window_if_due(&mut coordinator).await?;
            }

            for task in &mut self.tasks {
                task.send().await?;
            }

            // A shutdown request is honored only after send and commit, so
            // enqueued outputs are never dropped; the final iteration always
            // commits.
            let shutting_down =
                coordinator.shutdown_requested() || self.shutdown.is_cancelled();
            if shutting_down {
                coordinator.request_commit();
            }

            for task in &mut self.tasks {
                task.commit_if_due(&coordinator, self.checkpoints.as_deref_mut())
                    .await?;
            }

            self.iterations.inc();
            if shutting_down {
                tracing::info!("shutdown requested, leaving run loop");
                return Ok(());
            }
        }
    }

    /// Reverse-order stop. Every subsystem that started is stopped exactly
    /// once; failures are logged and never skip the remaining stops.
    async fn shutdown_subsystems(&mut self) {
        if self.started.consumers {
            self.consumers.stop().await;
        }
        if self.started.producers {
            self.producers.stop().await;
        }
        if self.started.tasks {
            for task in &mut self.tasks {
                task.close().await;
            }
        }
        if self.started.stores {
            for task in &mut self.tasks {
                task.stop_stores();
            }
        }
        if self.started.checkpoints {
            if let Some(manager) = self.checkpoints.as_deref_mut() {
                if let Err(error) = manager.stop() {
                    tracing::error!(error = %error, "checkpoint manager failed to stop");
                }
            }
        }
        if self.started.metrics {
            self.stop_metrics().await;
        }
        self.started = StartedFlags::default();
    }

    async fn start_metrics(&mut self) -> Result<()> {
        if !self.reporters.is_empty() {
            let token = CancellationToken::new();
            let handle = tokio::spawn(report_loop(
                token.clone(),
                self.reporter_interval,
                self.reporters.clone(),
                self.registries.clone(),
            ));
            self.reporter_task = Some((token, handle));
        }
        if let Some(port) = self.diagnostics_port {
            self.diagnostics = Some(
                DiagnosticsServer::start(
                    port,
                    self.name.clone(),
                    self.run_id.clone(),
                    self.registries.clone(),
                )
                .await?,
            );
        }
        Ok(())
    }

    async fn stop_metrics(&mut self) {
        if let Some((token, handle)) = self.reporter_task.take() {
            token.cancel();
            let _ = handle.await;
            // One final snapshot so short runs still report.
            let snapshots: Vec<_> = self.registries.iter().map(|r| r.snapshot()).collect();
            for reporter in &self.reporters {
                reporter.report(&snapshots);
            }
        }
        if let Some(mut server) = self.diagnostics.take() {
            server.stop().await;
        }
    }
}

async fn report_loop(
    token: CancellationToken,
    interval: Duration,
    reporters: Vec<Arc<dyn MetricsReporter>>,
    registries: Vec<Arc<MetricsRegistry>>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshots: Vec<_> = registries.iter().map(|r| r.snapshot()).collect();
                for reporter in &reporters {
                    reporter.report(&snapshots);
                }
            }
        }
    }
}

/// Container subprocess entry: read `TASK_NAME`, `CONFIG`, and
/// `PARTITION_IDS` from the environment, wire a container against the given
/// registry, and run it to completion.
pub async fn run_from_env(registry: FactoryRegistry) -> Result<()> {
    let name = std::env::var("TASK_NAME")
        .map_err(|_| Error::config("TASK_NAME", "environment variable not set"))?;
    let raw_config = std::env::var("CONFIG")
        .map_err(|_| Error::config("CONFIG", "environment variable not set"))?;
    let raw_partitions = std::env::var("PARTITION_IDS")
        .map_err(|_| Error::config("PARTITION_IDS", "environment variable not set"))?;

    let config = Config::from_json(&raw_config)?;
    crate::observability::init_logging(&config)?;
    let partitions = parse_partition_ids(&raw_partitions)?;
    let mut container = Container::from_config(name, partitions, config, registry)?;
    container.run().await
}

/// Parse the `PARTITION_IDS` environment value: a comma-separated,
/// non-empty list of partition integers.
pub fn parse_partition_ids(raw: &str) -> Result<Vec<Partition>> {
    let partitions: Vec<Partition> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<u32>()
                .map(Partition::new)
                .map_err(|_| Error::config("PARTITION_IDS", format!("invalid partition '{}'", item)))
        })
        .collect::<Result<_>>()?;
    if partitions.is_empty() {
        return Err(Error::config("PARTITION_IDS", "at least one partition required"));
    }
    Ok(partitions)
}
