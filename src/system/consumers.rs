//! Consumer multiplexer.
//!
//! Owns one consumer per messaging system and multiplexes their partitions
//! into a single `choose` stream for the run loop. Between the system
//! clients and the chooser sit per-partition FIFO buffers with two
//! watermarks: a partition whose buffer grows past the high watermark is
//! dropped from the fetch set (pausing its polls) and rejoins once draining
//! brings it back under the low watermark.
//!
//! Decoding happens here, on arrival: the chooser and the tasks only ever
//! see typed envelopes. A decode failure is fatal unless the container is
//! configured to drop undecodable envelopes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::SerdeManager;
use crate::envelope::IncomingMessageEnvelope;
use crate::metrics::{Counter, MetricsRegistry};
use crate::system::{MessageChooser, StartingOffset, SystemConsumer};
use crate::types::{Error, Result, SystemStreamPartition};

pub struct SystemConsumersOptions {
    /// Bounded wait when a poll finds nothing new.
    pub poll_timeout: Duration,
    /// Buffered envelopes at which a partition's fetching pauses.
    pub high_watermark: usize,
    /// Buffered envelopes at which a paused partition resumes.
    pub low_watermark: usize,
    /// Skip envelopes whose key or value fails to decode.
    pub drop_deserialization_errors: bool,
}

impl Default for SystemConsumersOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(10),
            high_watermark: 1024,
            low_watermark: 256,
            drop_deserialization_errors: false,
        }
    }
}

struct PartitionBuffer {
    queue: VecDeque<IncomingMessageEnvelope>,
    /// Head envelope currently held by the chooser.
    in_chooser: bool,
    /// Fetching paused: buffer crossed the high watermark.
    paused: bool,
}

pub struct SystemConsumers {
    consumers: HashMap<String, Box<dyn SystemConsumer>>,
    chooser: Box<dyn MessageChooser>,
    serdes: Arc<SerdeManager>,
    buffers: HashMap<SystemStreamPartition, PartitionBuffer>,
    options: SystemConsumersOptions,
    chosen: Counter,
    dropped: Counter,
    polls: Counter,
}

impl SystemConsumers {
    pub fn new(
        consumers: HashMap<String, Box<dyn SystemConsumer>>,
        chooser: Box<dyn MessageChooser>,
        serdes: Arc<SerdeManager>,
        options: SystemConsumersOptions,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            consumers,
            chooser,
            serdes,
            buffers: HashMap::new(),
            options,
            chosen: metrics.counter("consumers.envelopes-chosen"),
            dropped: metrics.counter("consumers.envelopes-dropped"),
            polls: metrics.counter("consumers.polls"),
        }
    }

    /// Register a partition with its starting offset, propagating to the
    /// owning system consumer and the chooser.
    pub fn register(&mut self, ssp: SystemStreamPartition, start: StartingOffset) -> Result<()> {
        let consumer = self.consumers.get_mut(ssp.system()).ok_or_else(|| {
            Error::setup(format!("no consumer for system '{}'", ssp.system()))
        })?;
        consumer.register(ssp.clone(), start.clone());
        self.chooser.register(ssp.clone(), start);
        self.buffers.insert(
            ssp,
            PartitionBuffer {
                queue: VecDeque::new(),
                in_chooser: false,
                paused: false,
            },
        );
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        for (system, consumer) in &mut self.consumers {
            consumer.start().await.map_err(|e| {
                Error::setup(format!(
                    "consumer for system '{}' failed to start: {}",
                    system, e
                ))
            })?;
        }
        Ok(())
    }

    /// Stop every consumer. Failures are logged, never propagated: shutdown
    /// must reach all subsystems.
    pub async fn stop(&mut self) {
        for (system, consumer) in &mut self.consumers {
            if let Err(e) = consumer.stop().await {
                tracing::error!(system, error = %e, "consumer failed to stop");
            }
        }
    }

    /// Return the next envelope across all partitions, or `None` after a
    /// bounded poll finds nothing ready. At most one envelope per call; the
    /// per-partition order is exactly the order the system delivered.
    ///
    /// Every call polls: with a zero timeout while envelopes are flowing
    /// (keeping the buffers topped up, which is what makes the watermarks
    /// meaningful), and with the configured no-new-message timeout when the
    /// chooser comes up empty.
    pub async fn choose(&mut self) -> Result<Option<IncomingMessageEnvelope>> {
        if let Some(envelope) = self.chooser.choose() {
            self.chosen.inc();
            self.refill(&envelope.ssp);
            self.poll(Duration::ZERO).await?;
            return Ok(Some(envelope));
        }
        self.poll(self.options.poll_timeout).await?;
        Ok(None)
    }

    /// After the chooser hands out a partition's head, offer it the next
    /// buffered envelope and resume fetching if the buffer drained enough.
    fn refill(&mut self, ssp: &SystemStreamPartition) {
        let Some(buffer) = self.buffers.get_mut(ssp) else {
            return;
        };
        buffer.in_chooser = false;
        if let Some(next) = buffer.queue.pop_front() {
            buffer.in_chooser = true;
            self.chooser.update(next);
        }
        if buffer.paused && buffer.queue.len() <= self.options.low_watermark {
            buffer.paused = false;
        }
    }

    /// Poll every system for its fetchable partitions and route arrivals
    /// through decode into the chooser and buffers.
    async fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.polls.inc();
        for (system, consumer) in &mut self.consumers {
            let fetchable: HashSet<SystemStreamPartition> = self
                .buffers
                .iter()
                .filter(|(ssp, buffer)| ssp.system() == system.as_str() && !buffer.paused)
                .map(|(ssp, _)| ssp.clone())
                .collect();
            if fetchable.is_empty() {
                continue;
            }

            let batches = consumer.poll(&fetchable, timeout).await?;
            for (_, envelopes) in batches {
                for envelope in envelopes {
                    let envelope = match self.serdes.decode(envelope) {
                        Ok(envelope) => envelope,
                        Err(e) if self.options.drop_deserialization_errors => {
                            tracing::warn!(error = %e, "dropping undecodable envelope");
                            self.dropped.inc();
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    let Some(buffer) = self.buffers.get_mut(&envelope.ssp) else {
                        tracing::warn!(ssp = %envelope.ssp, "envelope for unregistered partition");
                        continue;
                    };
                    if buffer.in_chooser {
                        buffer.queue.push_back(envelope);
                    } else {
                        buffer.in_chooser = true;
                        self.chooser.update(envelope);
                    }
                    if buffer.queue.len() >= self.options.high_watermark {
                        buffer.paused = true;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerde;
    use crate::envelope::Payload;
    use crate::system::chooser::RoundRobinChooser;
    use crate::types::{Offset, Partition};
    use async_trait::async_trait;
    use serde_json::json;

    /// Scripted consumer: returns pre-loaded batches, one per poll, but only
    /// for partitions the caller actually asked for. Records every poll's
    /// requested partition set for assertions.
    struct ScriptedConsumer {
        batches: VecDeque<Vec<IncomingMessageEnvelope>>,
        polled_ssps: Arc<std::sync::Mutex<Vec<HashSet<SystemStreamPartition>>>>,
    }

    #[async_trait]
    impl SystemConsumer for ScriptedConsumer {
        fn register(&mut self, _ssp: SystemStreamPartition, _start: StartingOffset) {}

        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        async fn poll(
            &mut self,
            ssps: &HashSet<SystemStreamPartition>,
            _timeout: Duration,
        ) -> Result<HashMap<SystemStreamPartition, Vec<IncomingMessageEnvelope>>> {
            self.polled_ssps.lock().unwrap().push(ssps.clone());
            let mut out: HashMap<SystemStreamPartition, Vec<IncomingMessageEnvelope>> =
                HashMap::new();
            if let Some(batch) = self.batches.pop_front() {
                for envelope in batch {
                    if ssps.contains(&envelope.ssp) {
                        out.entry(envelope.ssp.clone()).or_default().push(envelope);
                    }
                }
            }
            Ok(out)
        }

        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn raw_envelope(ssp: &SystemStreamPartition, offset: u64, value: &str) -> IncomingMessageEnvelope {
        IncomingMessageEnvelope::new(
            ssp.clone(),
            Offset::from(offset.to_string()),
            None,
            Some(Payload::raw(value.as_bytes().to_vec())),
        )
    }

    type PolledLog = Arc<std::sync::Mutex<Vec<HashSet<SystemStreamPartition>>>>;

    fn multiplexer(
        batches: Vec<Vec<IncomingMessageEnvelope>>,
        options: SystemConsumersOptions,
    ) -> (SystemConsumers, PolledLog) {
        let mut serdes = SerdeManager::new();
        serdes.bind_system("sys", None, Some(Arc::new(JsonSerde)));
        let polled: PolledLog = Arc::default();
        let consumer = ScriptedConsumer {
            batches: batches.into(),
            polled_ssps: Arc::clone(&polled),
        };
        let mut consumers: HashMap<String, Box<dyn SystemConsumer>> = HashMap::new();
        consumers.insert("sys".to_string(), Box::new(consumer));
        let registry = MetricsRegistry::new("test");
        let multiplexer = SystemConsumers::new(
            consumers,
            Box::new(RoundRobinChooser::new()),
            Arc::new(serdes),
            options,
            &registry,
        );
        (multiplexer, polled)
    }

    #[tokio::test]
    async fn test_choose_preserves_per_partition_order() {
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        let batch = vec![
            raw_envelope(&ssp, 0, "\"a\""),
            raw_envelope(&ssp, 1, "\"b\""),
            raw_envelope(&ssp, 2, "\"c\""),
        ];
        let (mut consumers, _) = multiplexer(vec![batch], SystemConsumersOptions::default());
        consumers
            .register(ssp.clone(), StartingOffset::Earliest)
            .unwrap();

        // First call polls and buffers; subsequent calls drain in order.
        assert!(consumers.choose().await.unwrap().is_none());
        let mut seen = Vec::new();
        while let Some(envelope) = consumers.choose().await.unwrap() {
            seen.push(envelope.typed_value().unwrap().clone());
        }
        assert_eq!(seen, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_high_watermark_pauses_fetching() {
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        let batch: Vec<_> = (0..4).map(|i| raw_envelope(&ssp, i, "\"x\"")).collect();
        let options = SystemConsumersOptions {
            high_watermark: 3,
            low_watermark: 1,
            poll_timeout: Duration::ZERO,
            drop_deserialization_errors: false,
        };
        let (mut consumers, _) = multiplexer(vec![batch], options);
        consumers
            .register(ssp.clone(), StartingOffset::Earliest)
            .unwrap();

        // The poll buffers 4 envelopes: 1 in the chooser + 3 queued, which
        // crosses the high watermark and pauses the partition.
        assert!(consumers.choose().await.unwrap().is_none());
        assert!(consumers.buffers[&ssp].paused);

        // Draining to the low watermark resumes fetching.
        assert!(consumers.choose().await.unwrap().is_some());
        assert!(consumers.buffers[&ssp].paused);
        assert!(consumers.choose().await.unwrap().is_some());
        assert!(!consumers.buffers[&ssp].paused);
    }

    #[tokio::test]
    async fn test_paused_partition_is_excluded_from_polls() {
        let p0 = SystemStreamPartition::new("sys", "s", Partition::new(0));
        let p1 = SystemStreamPartition::new("sys", "s", Partition::new(1));
        let batch = vec![
            raw_envelope(&p0, 0, "\"x\""),
            raw_envelope(&p0, 1, "\"x\""),
            raw_envelope(&p0, 2, "\"x\""),
            raw_envelope(&p1, 0, "\"y\""),
        ];
        let options = SystemConsumersOptions {
            high_watermark: 2,
            low_watermark: 0,
            poll_timeout: Duration::ZERO,
            drop_deserialization_errors: false,
        };
        let (mut consumers, polled) = multiplexer(vec![batch], options);
        consumers
            .register(p0.clone(), StartingOffset::Earliest)
            .unwrap();
        consumers
            .register(p1.clone(), StartingOffset::Earliest)
            .unwrap();

        // First poll buffers partition 0 past the high watermark.
        assert!(consumers.choose().await.unwrap().is_none());
        assert!(consumers.buffers[&p0].paused);

        // The next choice's top-up poll must request partition 1 only.
        assert!(consumers.choose().await.unwrap().is_some());
        let polled = polled.lock().unwrap();
        assert!(
            polled
                .iter()
                .any(|set| set.contains(&p1) && !set.contains(&p0)),
            "no poll excluded the paused partition: {:?}",
            polled
        );
    }

    #[tokio::test]
    async fn test_drop_deserialization_errors_skips_envelope() {
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        let batch = vec![
            raw_envelope(&ssp, 0, "\"good\""),
            raw_envelope(&ssp, 1, "not-json"),
            raw_envelope(&ssp, 2, "\"also-good\""),
        ];
        let options = SystemConsumersOptions {
            drop_deserialization_errors: true,
            poll_timeout: Duration::ZERO,
            ..SystemConsumersOptions::default()
        };
        let (mut consumers, _) = multiplexer(vec![batch], options);
        consumers
            .register(ssp.clone(), StartingOffset::Earliest)
            .unwrap();

        assert!(consumers.choose().await.unwrap().is_none());
        let mut seen = Vec::new();
        while let Some(envelope) = consumers.choose().await.unwrap() {
            seen.push(envelope.typed_value().unwrap().clone());
        }
        assert_eq!(seen, vec![json!("good"), json!("also-good")]);
        assert_eq!(consumers.dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_decode_error_is_fatal_by_default() {
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        let batch = vec![raw_envelope(&ssp, 0, "not-json")];
        let options = SystemConsumersOptions {
            poll_timeout: Duration::ZERO,
            ..SystemConsumersOptions::default()
        };
        let (mut consumers, _) = multiplexer(vec![batch], options);
        consumers
            .register(ssp.clone(), StartingOffset::Earliest)
            .unwrap();
        assert!(consumers.choose().await.is_err());
    }

    #[tokio::test]
    async fn test_register_unknown_system_fails() {
        let (mut consumers, _) = multiplexer(vec![], SystemConsumersOptions::default());
        let ssp = SystemStreamPartition::new("other", "s", Partition::new(0));
        assert!(consumers.register(ssp, StartingOffset::Earliest).is_err());
    }
}
