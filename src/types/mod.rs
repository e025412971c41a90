//! Core types: identifiers, configuration access, and errors.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{
    Config, ContainerConfig, MetricsConfig, OffsetReset, SerializerConfig, StoreConfig,
    StreamConfig, SystemConfig, TaskConfig,
};
pub use errors::{Error, Result};
pub use ids::{Offset, Partition, SystemStream, SystemStreamPartition, TaskName};
