//! Messaging-system capability contracts.
//!
//! Concrete messaging systems plug in through [`SystemFactory`], which
//! builds the three per-system capabilities: a consumer (partitioned,
//! offset-ordered reads), a producer (at-least-once writes), and an admin
//! (stream metadata). The container only ever talks to these traits; the
//! in-memory system in [`memory`] is the built-in reference implementation.

pub mod chooser;
pub mod consumers;
pub mod memory;
pub mod producers;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{IncomingMessageEnvelope, OutgoingMessageEnvelope};
use crate::types::{Config, Offset, Partition, Result, SystemStreamPartition};

pub use chooser::{ChooserFactory, MessageChooser, RoundRobinChooser, RoundRobinChooserFactory};
pub use consumers::{SystemConsumers, SystemConsumersOptions};
pub use memory::{InMemoryBroker, InMemorySystemFactory, StoredMessage};
pub use producers::{SharedProducers, SystemProducers};

/// Where a registered partition starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartingOffset {
    /// Resume after this offset — the offset of the last processed
    /// envelope, per the checkpoint convention.
    Resume(Offset),
    /// Start at the oldest available message.
    Earliest,
    /// Start at the upcoming message; the backlog is skipped.
    Latest,
}

/// Offset bounds of one partition as reported by the owning system.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionMetadata {
    /// Oldest readable offset; `None` for an empty partition.
    pub oldest: Option<Offset>,
    /// Newest readable offset (the head); `None` for an empty partition.
    pub newest: Option<Offset>,
    /// Offset the next produced message will receive.
    pub upcoming: Offset,
}

/// Per-partition metadata for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemStreamMetadata {
    pub partitions: HashMap<Partition, PartitionMetadata>,
}

/// Partitioned reader for one messaging system.
///
/// Implementations deliver envelopes for each registered partition in
/// strictly increasing offset order. All registrations happen before
/// `start`.
#[async_trait]
pub trait SystemConsumer: Send {
    fn register(&mut self, ssp: SystemStreamPartition, start: StartingOffset);

    async fn start(&mut self) -> Result<()>;

    /// Fetch whatever is available for the requested partitions, waiting at
    /// most `timeout` when nothing is available.
    async fn poll(
        &mut self,
        ssps: &HashSet<SystemStreamPartition>,
        timeout: Duration,
    ) -> Result<HashMap<SystemStreamPartition, Vec<IncomingMessageEnvelope>>>;

    async fn stop(&mut self) -> Result<()>;
}

/// Writer for one messaging system. `flush(source)` returns only once every
/// envelope previously sent for that source is durable from the system's
/// perspective — the at-least-once fence the commit protocol relies on.
#[async_trait]
pub trait SystemProducer: Send {
    async fn start(&mut self) -> Result<()>;

    fn register(&mut self, source: &str);

    async fn send(&mut self, source: &str, envelope: OutgoingMessageEnvelope) -> Result<()>;

    async fn flush(&mut self, source: &str) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

/// Metadata access for one messaging system.
pub trait SystemAdmin: Send {
    /// Offset bounds for the named streams, keyed by stream name. Unknown
    /// streams yield metadata with no partitions.
    fn stream_metadata(&self, streams: &[&str]) -> Result<HashMap<String, SystemStreamMetadata>>;
}

/// Builds the capabilities of one named messaging system.
pub trait SystemFactory: Send + Sync {
    fn consumer(&self, system: &str, config: &Config) -> Result<Box<dyn SystemConsumer>>;
    fn producer(&self, system: &str, config: &Config) -> Result<Box<dyn SystemProducer>>;
    fn admin(&self, system: &str, config: &Config) -> Result<Box<dyn SystemAdmin>>;
}
