//! Strongly-typed stream identifiers.
//!
//! A [`SystemStreamPartition`] is the unit of ordering and checkpointing:
//! everything the container consumes, buffers, chooses, and commits is keyed
//! by it. All identifier types are cheap to clone, hashable, and `Ord` so
//! that iteration orders stay deterministic.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Error, Result};

/// One shard of an input stream. Opaque, immutable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Partition(pub u32);

impl Partition {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical stream within a named messaging system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemStream {
    pub system: String,
    pub stream: String,
}

impl SystemStream {
    pub fn new(system: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            stream: stream.into(),
        }
    }

    /// Parse a `system.stream` identifier as it appears in config values.
    ///
    /// The split is on the first dot; stream names may themselves contain
    /// dots, system names may not.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('.') {
            Some((system, stream)) if !system.is_empty() && !stream.is_empty() => {
                Ok(Self::new(system, stream))
            }
            _ => Err(Error::setup(format!(
                "invalid stream identifier '{}', expected 'system.stream'",
                raw
            ))),
        }
    }

    pub fn partition(&self, partition: Partition) -> SystemStreamPartition {
        SystemStreamPartition {
            system_stream: self.clone(),
            partition,
        }
    }
}

impl fmt::Display for SystemStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.system, self.stream)
    }
}

/// The (system, stream, partition) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemStreamPartition {
    pub system_stream: SystemStream,
    pub partition: Partition,
}

impl SystemStreamPartition {
    pub fn new(system: impl Into<String>, stream: impl Into<String>, partition: Partition) -> Self {
        Self {
            system_stream: SystemStream::new(system, stream),
            partition,
        }
    }

    pub fn system(&self) -> &str {
        &self.system_stream.system
    }

    pub fn stream(&self) -> &str {
        &self.system_stream.stream
    }
}

impl fmt::Display for SystemStreamPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.system_stream, self.partition)
    }
}

/// Position within one SystemStreamPartition. Interpreted only by the owning
/// messaging system; monotonic per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(String);

impl Offset {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Offset {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Offset {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Identifies one task instance (one owned partition) within the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(String);

impl TaskName {
    pub fn for_partition(partition: Partition) -> Self {
        Self(format!("partition-{}", partition.id()))
    }

    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_stream_parse() {
        let ss = SystemStream::parse("kafka.orders").unwrap();
        assert_eq!(ss.system, "kafka");
        assert_eq!(ss.stream, "orders");

        // Stream names may contain dots; the split is on the first one.
        let ss = SystemStream::parse("kafka.orders.v2").unwrap();
        assert_eq!(ss.system, "kafka");
        assert_eq!(ss.stream, "orders.v2");

        assert!(SystemStream::parse("no-dot").is_err());
        assert!(SystemStream::parse(".stream").is_err());
        assert!(SystemStream::parse("system.").is_err());
    }

    #[test]
    fn test_ssp_display() {
        let ssp = SystemStreamPartition::new("kafka", "orders", Partition::new(3));
        assert_eq!(ssp.to_string(), "kafka.orders.3");
        assert_eq!(ssp.system(), "kafka");
        assert_eq!(ssp.stream(), "orders");
    }

    #[test]
    fn test_ssp_ordering_is_deterministic() {
        let a = SystemStreamPartition::new("a", "s", Partition::new(0));
        let b = SystemStreamPartition::new("a", "s", Partition::new(1));
        let c = SystemStreamPartition::new("b", "s", Partition::new(0));
        let mut v = vec![c.clone(), b.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn test_task_name_for_partition() {
        assert_eq!(
            TaskName::for_partition(Partition::new(7)).as_str(),
            "partition-7"
        );
    }
}
