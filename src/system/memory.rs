//! In-memory messaging system.
//!
//! The built-in reference implementation of the system contracts, and the
//! transport the integration suite runs on. Streams live in a process-wide
//! broker table keyed by *scope* so separately-wired consumers, producers,
//! and admins (and test code) can share one broker. A partition is an
//! append-only log; offsets are stringified indices and stay monotonic.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::envelope::{IncomingMessageEnvelope, OutgoingMessageEnvelope, Payload};
use crate::system::{
    PartitionMetadata, StartingOffset, SystemAdmin, SystemConsumer, SystemFactory, SystemProducer,
    SystemStreamMetadata,
};
use crate::types::{
    Config, Error, Offset, Partition, Result, SystemConfig, SystemStreamPartition,
};

/// Max envelopes returned per partition per poll.
const POLL_BATCH: usize = 1000;

/// One message at rest in the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of the first retained message.
    base: u64,
    messages: Vec<StoredMessage>,
}

impl PartitionLog {
    fn upcoming(&self) -> u64 {
        self.base + self.messages.len() as u64
    }
}

static SCOPES: OnceLock<Mutex<HashMap<String, Arc<InMemoryBroker>>>> = OnceLock::new();

/// Process-wide shared stream state for one scope.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    streams: Mutex<HashMap<String, Vec<PartitionLog>>>,
}

impl InMemoryBroker {
    /// The broker for a scope, created on first use.
    pub fn scope(name: &str) -> Arc<InMemoryBroker> {
        let scopes = SCOPES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut scopes = scopes.lock().expect("broker scope table poisoned");
        Arc::clone(scopes.entry(name.to_string()).or_default())
    }

    /// Create or replace a partition log starting at `base`. Test seeding
    /// and trimmed-log simulation.
    pub fn seed(&self, stream: &str, partition: Partition, base: u64, messages: Vec<StoredMessage>) {
        let mut streams = self.streams.lock().expect("broker poisoned");
        let logs = streams.entry(stream.to_string()).or_default();
        let index = partition.id() as usize;
        while logs.len() <= index {
            logs.push(PartitionLog::default());
        }
        logs[index] = PartitionLog { base, messages };
    }

    /// Append one message, creating the stream/partition as needed. Without
    /// an explicit partition the destination is a stable hash of the key,
    /// else partition 0.
    pub fn produce(
        &self,
        stream: &str,
        partition: Option<Partition>,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> (Partition, Offset) {
        let mut streams = self.streams.lock().expect("broker poisoned");
        let logs = streams.entry(stream.to_string()).or_default();
        if logs.is_empty() {
            logs.push(PartitionLog::default());
        }

        let partition = partition.unwrap_or_else(|| match &key {
            Some(bytes) => {
                let mut hasher = DefaultHasher::new();
                bytes.hash(&mut hasher);
                Partition::new((hasher.finish() % logs.len() as u64) as u32)
            }
            None => Partition::new(0),
        });

        let index = partition.id() as usize;
        while logs.len() <= index {
            logs.push(PartitionLog::default());
        }
        let log = &mut logs[index];
        let offset = log.upcoming();
        log.messages.push(StoredMessage { key, value });
        (partition, Offset::from(offset.to_string()))
    }

    /// Messages with offsets in `[from, from + max)`, with their offsets.
    fn read_from(
        &self,
        stream: &str,
        partition: Partition,
        from: u64,
        max: usize,
    ) -> Vec<(u64, StoredMessage)> {
        let streams = self.streams.lock().expect("broker poisoned");
        let Some(log) = streams
            .get(stream)
            .and_then(|logs| logs.get(partition.id() as usize))
        else {
            return Vec::new();
        };
        let start = from.max(log.base);
        let index = (start - log.base) as usize;
        log.messages
            .iter()
            .skip(index)
            .take(max)
            .cloned()
            .enumerate()
            .map(|(i, message)| (start + i as u64, message))
            .collect()
    }

    fn metadata(&self, stream: &str) -> SystemStreamMetadata {
        let streams = self.streams.lock().expect("broker poisoned");
        let mut partitions = HashMap::new();
        if let Some(logs) = streams.get(stream) {
            for (index, log) in logs.iter().enumerate() {
                let newest = log.upcoming().checked_sub(1).filter(|_| !log.messages.is_empty());
                partitions.insert(
                    Partition::new(index as u32),
                    PartitionMetadata {
                        oldest: (!log.messages.is_empty())
                            .then(|| Offset::from(log.base.to_string())),
                        newest: newest.map(|n| Offset::from(n.to_string())),
                        upcoming: Offset::from(log.upcoming().to_string()),
                    },
                );
            }
        }
        SystemStreamMetadata { partitions }
    }

    /// All retained messages of one partition, oldest first. Test inspection.
    pub fn messages(&self, stream: &str, partition: Partition) -> Vec<StoredMessage> {
        let streams = self.streams.lock().expect("broker poisoned");
        streams
            .get(stream)
            .and_then(|logs| logs.get(partition.id() as usize))
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }
}

fn parse_offset(offset: &Offset) -> Result<u64> {
    offset.as_str().parse::<u64>().map_err(|_| {
        Error::setup(format!(
            "in-memory system got foreign offset '{}'",
            offset.as_str()
        ))
    })
}

// =============================================================================
// Consumer
// =============================================================================

pub struct InMemorySystemConsumer {
    broker: Arc<InMemoryBroker>,
    registrations: HashMap<SystemStreamPartition, StartingOffset>,
    cursors: HashMap<SystemStreamPartition, u64>,
    started: bool,
}

impl InMemorySystemConsumer {
    fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            registrations: HashMap::new(),
            cursors: HashMap::new(),
            started: false,
        }
    }

    fn gather(
        &mut self,
        ssps: &HashSet<SystemStreamPartition>,
    ) -> HashMap<SystemStreamPartition, Vec<IncomingMessageEnvelope>> {
        let mut out = HashMap::new();
        for ssp in ssps {
            let Some(cursor) = self.cursors.get_mut(ssp) else {
                continue;
            };
            let read = self
                .broker
                .read_from(ssp.stream(), ssp.partition, *cursor, POLL_BATCH);
            if read.is_empty() {
                continue;
            }
            *cursor = read.last().map(|(offset, _)| offset + 1).unwrap_or(*cursor);
            let envelopes = read
                .into_iter()
                .map(|(offset, message)| {
                    IncomingMessageEnvelope::new(
                        ssp.clone(),
                        Offset::from(offset.to_string()),
                        message.key.map(Payload::Raw),
                        message.value.map(Payload::Raw),
                    )
                })
                .collect();
            out.insert(ssp.clone(), envelopes);
        }
        out
    }
}

#[async_trait]
impl SystemConsumer for InMemorySystemConsumer {
    fn register(&mut self, ssp: SystemStreamPartition, start: StartingOffset) {
        self.registrations.insert(ssp, start);
    }

    async fn start(&mut self) -> Result<()> {
        for (ssp, start) in &self.registrations {
            let cursor = match start {
                StartingOffset::Resume(offset) => parse_offset(offset)? + 1,
                StartingOffset::Earliest => 0,
                StartingOffset::Latest => {
                    let metadata = self.broker.metadata(ssp.stream());
                    metadata
                        .partitions
                        .get(&ssp.partition)
                        .map(|p| parse_offset(&p.upcoming))
                        .transpose()?
                        .unwrap_or(0)
                }
            };
            self.cursors.insert(ssp.clone(), cursor);
        }
        self.started = true;
        Ok(())
    }

    async fn poll(
        &mut self,
        ssps: &HashSet<SystemStreamPartition>,
        timeout: Duration,
    ) -> Result<HashMap<SystemStreamPartition, Vec<IncomingMessageEnvelope>>> {
        debug_assert!(self.started, "poll before start");
        let deadline = Instant::now() + timeout;
        loop {
            let out = self.gather(ssps);
            if !out.is_empty() || Instant::now() >= deadline {
                return Ok(out);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }
}

// =============================================================================
// Producer
// =============================================================================

pub struct InMemorySystemProducer {
    broker: Arc<InMemoryBroker>,
    sources: HashSet<String>,
}

impl InMemorySystemProducer {
    fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            sources: HashSet::new(),
        }
    }
}

#[async_trait]
impl SystemProducer for InMemorySystemProducer {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn register(&mut self, source: &str) {
        self.sources.insert(source.to_string());
    }

    async fn send(&mut self, source: &str, envelope: OutgoingMessageEnvelope) -> Result<()> {
        debug_assert!(self.sources.contains(source), "send from unregistered source");
        let context = envelope.system_stream.to_string();
        let key = match envelope.key {
            Some(Payload::Raw(bytes)) => Some(bytes),
            Some(Payload::Typed(_)) => {
                return Err(Error::serde(context, "unencoded key reached producer"))
            }
            None => None,
        };
        let value = match envelope.value {
            Some(Payload::Raw(bytes)) => Some(bytes),
            Some(Payload::Typed(_)) => {
                return Err(Error::serde(context, "unencoded value reached producer"))
            }
            None => None,
        };
        self.broker
            .produce(&envelope.system_stream.stream, envelope.partition, key, value);
        Ok(())
    }

    async fn flush(&mut self, _source: &str) -> Result<()> {
        // Appends are immediately durable in this system.
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Admin & factory
// =============================================================================

pub struct InMemorySystemAdmin {
    broker: Arc<InMemoryBroker>,
}

impl SystemAdmin for InMemorySystemAdmin {
    fn stream_metadata(&self, streams: &[&str]) -> Result<HashMap<String, SystemStreamMetadata>> {
        Ok(streams
            .iter()
            .map(|stream| (stream.to_string(), self.broker.metadata(stream)))
            .collect())
    }
}

pub struct InMemorySystemFactory;

impl InMemorySystemFactory {
    fn broker(system: &str, config: &Config) -> Arc<InMemoryBroker> {
        InMemoryBroker::scope(&SystemConfig::new(config).inmemory_scope(system))
    }
}

impl SystemFactory for InMemorySystemFactory {
    fn consumer(&self, system: &str, config: &Config) -> Result<Box<dyn SystemConsumer>> {
        Ok(Box::new(InMemorySystemConsumer::new(Self::broker(
            system, config,
        ))))
    }

    fn producer(&self, system: &str, config: &Config) -> Result<Box<dyn SystemProducer>> {
        Ok(Box::new(InMemorySystemProducer::new(Self::broker(
            system, config,
        ))))
    }

    fn admin(&self, system: &str, config: &Config) -> Result<Box<dyn SystemAdmin>> {
        Ok(Box::new(InMemorySystemAdmin {
            broker: Self::broker(system, config),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(value: &[u8]) -> StoredMessage {
        StoredMessage {
            key: None,
            value: Some(value.to_vec()),
        }
    }

    fn unique_scope(label: &str) -> String {
        format!("{}-{}", label, uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_produce_assigns_monotonic_offsets() {
        let broker = InMemoryBroker::scope(&unique_scope("mono"));
        let (_, o1) = broker.produce("s", Some(Partition::new(0)), None, Some(b"a".to_vec()));
        let (_, o2) = broker.produce("s", Some(Partition::new(0)), None, Some(b"b".to_vec()));
        assert_eq!(o1.as_str(), "0");
        assert_eq!(o2.as_str(), "1");
    }

    #[test]
    fn test_seed_with_base_offsets() {
        let broker = InMemoryBroker::scope(&unique_scope("base"));
        broker.seed(
            "s",
            Partition::new(0),
            10,
            vec![message(b"a"), message(b"b"), message(b"c")],
        );
        let metadata = broker.metadata("s");
        let p0 = &metadata.partitions[&Partition::new(0)];
        assert_eq!(p0.oldest.as_ref().unwrap().as_str(), "10");
        assert_eq!(p0.newest.as_ref().unwrap().as_str(), "12");
        assert_eq!(p0.upcoming.as_str(), "13");

        let read = broker.read_from("s", Partition::new(0), 11, 10);
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].0, 11);
        assert_eq!(read[0].1.value.as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn test_unknown_stream_metadata_is_empty() {
        let broker = InMemoryBroker::scope(&unique_scope("unknown"));
        assert!(broker.metadata("nope").partitions.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_resume_starts_after_offset() {
        let scope = unique_scope("resume");
        let broker = InMemoryBroker::scope(&scope);
        broker.seed(
            "s",
            Partition::new(0),
            0,
            vec![message(b"a"), message(b"b"), message(b"c")],
        );

        let mut consumer = InMemorySystemConsumer::new(Arc::clone(&broker));
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        consumer.register(ssp.clone(), StartingOffset::Resume(Offset::from("0")));
        consumer.start().await.unwrap();

        let ssps: HashSet<_> = [ssp.clone()].into();
        let batches = consumer.poll(&ssps, Duration::ZERO).await.unwrap();
        let envelopes = &batches[&ssp];
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].offset.as_str(), "1");
        assert_eq!(envelopes[1].offset.as_str(), "2");
    }

    #[tokio::test]
    async fn test_consumer_latest_skips_backlog() {
        let scope = unique_scope("latest");
        let broker = InMemoryBroker::scope(&scope);
        broker.seed("s", Partition::new(0), 0, vec![message(b"old")]);

        let mut consumer = InMemorySystemConsumer::new(Arc::clone(&broker));
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        consumer.register(ssp.clone(), StartingOffset::Latest);
        consumer.start().await.unwrap();

        let ssps: HashSet<_> = [ssp.clone()].into();
        assert!(consumer.poll(&ssps, Duration::ZERO).await.unwrap().is_empty());

        broker.produce("s", Some(Partition::new(0)), None, Some(b"new".to_vec()));
        let batches = consumer.poll(&ssps, Duration::ZERO).await.unwrap();
        assert_eq!(batches[&ssp][0].value.as_ref().unwrap().as_raw(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_producer_requires_encoded_payloads() {
        let scope = unique_scope("encoded");
        let mut producer = InMemorySystemProducer::new(InMemoryBroker::scope(&scope));
        producer.register("task");
        let envelope = OutgoingMessageEnvelope::new(
            crate::types::SystemStream::new("sys", "s"),
            serde_json::json!("v"),
        );
        assert!(producer.send("task", envelope).await.is_err());
    }
}
