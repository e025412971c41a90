//! Producer multiplexer.
//!
//! Routes each outbound envelope to the producer of its destination system,
//! encoding typed payloads on the way through. `flush(source)` fences every
//! write previously sent for that source; the commit protocol calls it
//! before a checkpoint is written, which is what makes the container
//! at-least-once.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use crate::codec::SerdeManager;
use crate::envelope::OutgoingMessageEnvelope;
use crate::metrics::{Counter, MetricsRegistry};
use crate::system::SystemProducer;
use crate::types::{Error, Result};

pub struct SystemProducers {
    producers: HashMap<String, Box<dyn SystemProducer>>,
    serdes: Arc<SerdeManager>,
    sources: HashSet<String>,
    sends: Counter,
    flushes: Counter,
}

impl SystemProducers {
    pub fn new(
        producers: HashMap<String, Box<dyn SystemProducer>>,
        serdes: Arc<SerdeManager>,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            producers,
            serdes,
            sources: HashSet::new(),
            sends: metrics.counter("producers.envelopes-sent"),
            flushes: metrics.counter("producers.flushes"),
        }
    }

    /// Register a source (one task) with every producer.
    pub fn register(&mut self, source: &str) {
        if self.sources.insert(source.to_string()) {
            for producer in self.producers.values_mut() {
                producer.register(source);
            }
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        for (system, producer) in &mut self.producers {
            producer.start().await.map_err(|e| {
                Error::setup(format!(
                    "producer for system '{}' failed to start: {}",
                    system, e
                ))
            })?;
        }
        Ok(())
    }

    /// Stop every producer. Failures are logged, never propagated: shutdown
    /// must reach all subsystems.
    pub async fn stop(&mut self) {
        for (system, producer) in &mut self.producers {
            if let Err(e) = producer.stop().await {
                tracing::error!(system, error = %e, "producer failed to stop");
            }
        }
    }

    /// Encode and route one envelope to its destination system's producer.
    pub async fn send(&mut self, source: &str, envelope: OutgoingMessageEnvelope) -> Result<()> {
        let envelope = self.serdes.encode(envelope)?;
        let system = envelope.system_stream.system.clone();
        let producer = self
            .producers
            .get_mut(&system)
            .ok_or_else(|| Error::setup(format!("no producer for system '{}'", system)))?;
        producer.send(source, envelope).await?;
        self.sends.inc();
        Ok(())
    }

    /// Block until every write buffered for this source is durable.
    pub async fn flush(&mut self, source: &str) -> Result<()> {
        for producer in self.producers.values_mut() {
            producer.flush(source).await?;
        }
        self.flushes.inc();
        Ok(())
    }
}

/// Single-threaded shared handle to the producer multiplexer.
///
/// The run loop, every task instance, and every changelog-backed store send
/// through the same multiplexer. All of them live on the container's one
/// data-path thread, so the sharing is `Rc<RefCell<_>>`; the thread-crossing
/// buffers live inside each system's own producer client.
#[derive(Clone)]
pub struct SharedProducers {
    inner: Rc<RefCell<SystemProducers>>,
}

impl SharedProducers {
    pub fn new(producers: SystemProducers) -> Self {
        Self {
            inner: Rc::new(RefCell::new(producers)),
        }
    }

    pub fn register(&self, source: &str) {
        self.inner.borrow_mut().register(source);
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.borrow_mut().start().await
    }

    pub async fn stop(&self) {
        self.inner.borrow_mut().stop().await
    }

    pub async fn send(&self, source: &str, envelope: OutgoingMessageEnvelope) -> Result<()> {
        self.inner.borrow_mut().send(source, envelope).await
    }

    pub async fn flush(&self, source: &str) -> Result<()> {
        self.inner.borrow_mut().flush(source).await
    }
}
