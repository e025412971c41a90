//! Message envelopes — the values flowing through the container.
//!
//! An inbound envelope is born raw (undecoded bytes straight from the
//! messaging system) and becomes typed once the serde layer has applied the
//! codec bound to its stream. [`Payload`] makes that distinction explicit so
//! changelog traffic, which is always pre-encoded by the store layer, can
//! cross the producer boundary without re-encoding, and restore can replay
//! raw bytes without decoding.

use serde_json::Value;

use crate::types::{Offset, Partition, SystemStream, SystemStreamPartition};

/// A key or value on the envelope boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Encoded bytes; what systems transport and stores persist.
    Raw(Vec<u8>),
    /// A decoded domain object.
    Typed(Value),
}

impl Payload {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Raw(bytes.into())
    }

    pub fn typed(value: Value) -> Self {
        Self::Typed(value)
    }

    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            Self::Typed(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Typed(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    pub fn into_raw(self) -> Option<Vec<u8>> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            Self::Typed(_) => None,
        }
    }
}

/// One message read from a SystemStreamPartition.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessageEnvelope {
    pub ssp: SystemStreamPartition,
    pub offset: Offset,
    pub key: Option<Payload>,
    pub value: Option<Payload>,
}

impl IncomingMessageEnvelope {
    pub fn new(
        ssp: SystemStreamPartition,
        offset: Offset,
        key: Option<Payload>,
        value: Option<Payload>,
    ) -> Self {
        Self {
            ssp,
            offset,
            key,
            value,
        }
    }

    /// The decoded key, if the key exists and has been decoded.
    pub fn typed_key(&self) -> Option<&Value> {
        self.key.as_ref().and_then(Payload::as_value)
    }

    /// The decoded value, if the value exists and has been decoded.
    pub fn typed_value(&self) -> Option<&Value> {
        self.value.as_ref().and_then(Payload::as_value)
    }
}

/// One message bound for a system stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessageEnvelope {
    pub system_stream: SystemStream,
    /// Explicit destination partition; producers fall back to key hashing.
    pub partition: Option<Partition>,
    pub key: Option<Payload>,
    pub value: Option<Payload>,
}

impl OutgoingMessageEnvelope {
    pub fn new(system_stream: SystemStream, value: Value) -> Self {
        Self {
            system_stream,
            partition: None,
            key: None,
            value: Some(Payload::Typed(value)),
        }
    }

    /// Pre-encoded envelope; the serde layer passes raw payloads through
    /// untouched. Changelog writes use this form.
    pub fn raw(
        system_stream: SystemStream,
        partition: Option<Partition>,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            system_stream,
            partition,
            key: key.map(Payload::Raw),
            value: value.map(Payload::Raw),
        }
    }

    pub fn with_key(mut self, key: Value) -> Self {
        self.key = Some(Payload::Typed(key));
        self
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Partition;
    use serde_json::json;

    #[test]
    fn test_payload_accessors() {
        let raw = Payload::raw(b"abc".to_vec());
        assert_eq!(raw.as_raw(), Some(&b"abc"[..]));
        assert!(raw.as_value().is_none());

        let typed = Payload::typed(json!({"k": 1}));
        assert!(typed.as_raw().is_none());
        assert_eq!(typed.as_value(), Some(&json!({"k": 1})));
    }

    #[test]
    fn test_outgoing_builder() {
        let env = OutgoingMessageEnvelope::new(SystemStream::new("sys", "out"), json!("v"))
            .with_key(json!("k"))
            .with_partition(Partition::new(2));
        assert_eq!(env.partition, Some(Partition::new(2)));
        assert_eq!(env.key.as_ref().unwrap().as_value(), Some(&json!("k")));
        assert_eq!(env.value.as_ref().unwrap().as_value(), Some(&json!("v")));
    }

    #[test]
    fn test_typed_accessors_require_decoded_payloads() {
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        let env = IncomingMessageEnvelope::new(
            ssp,
            Offset::from("0"),
            None,
            Some(Payload::raw(b"\"v\"".to_vec())),
        );
        assert!(env.typed_value().is_none());
        assert!(env.typed_key().is_none());
    }
}
