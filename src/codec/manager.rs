//! Codec application on the envelope boundary.
//!
//! The [`SerdeManager`] holds the codec bindings declared in config and
//! applies them in one place: inbound envelopes are decoded before they reach
//! the chooser, outbound envelopes are encoded before they reach a producer.
//!
//! Binding resolution, most specific first: stream-level binding, then
//! system-level binding, then pass-through. Changelog streams are exempt from
//! stream/system bindings entirely — their payloads are encoded by the store
//! layer with the store's own codecs and must cross this boundary untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::codec::Serde;
use crate::envelope::{IncomingMessageEnvelope, OutgoingMessageEnvelope, Payload};
use crate::types::{Error, Result, SystemStream};

#[derive(Clone, Default)]
struct Binding {
    key: Option<Arc<dyn Serde>>,
    msg: Option<Arc<dyn Serde>>,
}

#[derive(Default)]
pub struct SerdeManager {
    systems: HashMap<String, Binding>,
    streams: HashMap<SystemStream, Binding>,
    changelogs: HashSet<SystemStream>,
}

impl SerdeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_system(
        &mut self,
        system: impl Into<String>,
        key: Option<Arc<dyn Serde>>,
        msg: Option<Arc<dyn Serde>>,
    ) {
        self.systems.insert(system.into(), Binding { key, msg });
    }

    pub fn bind_stream(
        &mut self,
        stream: SystemStream,
        key: Option<Arc<dyn Serde>>,
        msg: Option<Arc<dyn Serde>>,
    ) {
        self.streams.insert(stream, Binding { key, msg });
    }

    /// Mark a stream as a store changelog: bindings never apply to it.
    pub fn register_changelog(&mut self, stream: SystemStream) {
        self.changelogs.insert(stream);
    }

    pub fn is_changelog(&self, stream: &SystemStream) -> bool {
        self.changelogs.contains(stream)
    }

    fn resolve(&self, stream: &SystemStream) -> Binding {
        if self.changelogs.contains(stream) {
            return Binding::default();
        }
        let system = self.systems.get(&stream.system);
        let per_stream = self.streams.get(stream);
        Binding {
            key: per_stream
                .and_then(|b| b.key.clone())
                .or_else(|| system.and_then(|b| b.key.clone())),
            msg: per_stream
                .and_then(|b| b.msg.clone())
                .or_else(|| system.and_then(|b| b.msg.clone())),
        }
    }

    /// Decode an inbound envelope's key and value with the most specific
    /// binding for its stream. Raw payloads with no binding stay raw.
    pub fn decode(&self, envelope: IncomingMessageEnvelope) -> Result<IncomingMessageEnvelope> {
        let binding = self.resolve(&envelope.ssp.system_stream);
        let context = envelope.ssp.to_string();
        let IncomingMessageEnvelope {
            ssp,
            offset,
            key,
            value,
        } = envelope;
        Ok(IncomingMessageEnvelope {
            ssp,
            offset,
            key: decode_payload(key, &binding.key, &context, "key")?,
            value: decode_payload(value, &binding.msg, &context, "value")?,
        })
    }

    /// Encode an outbound envelope. Typed payloads require a binding; raw
    /// payloads (including all changelog traffic) pass through unchanged.
    pub fn encode(&self, envelope: OutgoingMessageEnvelope) -> Result<OutgoingMessageEnvelope> {
        let binding = self.resolve(&envelope.system_stream);
        let context = envelope.system_stream.to_string();
        let OutgoingMessageEnvelope {
            system_stream,
            partition,
            key,
            value,
        } = envelope;
        Ok(OutgoingMessageEnvelope {
            key: encode_payload(key, &binding.key, &context, "key")?,
            value: encode_payload(value, &binding.msg, &context, "value")?,
            system_stream,
            partition,
        })
    }
}

fn decode_payload(
    payload: Option<Payload>,
    serde: &Option<Arc<dyn Serde>>,
    context: &str,
    side: &str,
) -> Result<Option<Payload>> {
    match (payload, serde) {
        (Some(Payload::Raw(bytes)), Some(serde)) => {
            let value = serde
                .decode(&bytes)
                .map_err(|e| Error::serde(format!("{} {}", side, context), e.to_string()))?;
            Ok(Some(Payload::Typed(value)))
        }
        // Already typed, or no binding: leave as-is.
        (payload, _) => Ok(payload),
    }
}

fn encode_payload(
    payload: Option<Payload>,
    serde: &Option<Arc<dyn Serde>>,
    context: &str,
    side: &str,
) -> Result<Option<Payload>> {
    match (payload, serde) {
        (Some(Payload::Typed(value)), Some(serde)) => {
            let bytes = serde
                .encode(&value)
                .map_err(|e| Error::serde(format!("{} {}", side, context), e.to_string()))?;
            Ok(Some(Payload::Raw(bytes)))
        }
        (Some(Payload::Typed(_)), None) => Err(Error::serde(
            format!("{} {}", side, context),
            "typed payload with no codec bound for its stream or system",
        )),
        (payload, _) => Ok(payload),
    }
}
