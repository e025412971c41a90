//! # Sluice Core - Partitioned Stream-Processing Container
//!
//! Rust implementation of the per-node container of a partitioned
//! stream-processing framework:
//! - Consumer multiplexing across messaging systems with per-partition
//!   backpressure and a pluggable chooser policy
//! - Producer multiplexing with per-source flush fencing (at-least-once)
//! - Changelog-backed local key-value state with restore-before-run
//! - Per-partition task instances with windowing, commits, and checkpoints
//! - A single-threaded cooperative run loop with ordered start/stop
//!
//! ## Architecture
//!
//! The container follows a single-actor model where one run loop owns all
//! mutable state:
//! ```text
//!   messaging systems → SystemConsumers ─┐
//!                        (chooser,       │ one envelope
//!                         backpressure)  ▼
//!                    ┌─────────────────────────────────┐
//!                    │        Container run loop       │
//!                    │  process → window → send → commit│
//!                    │  ┌─────────┐ ┌──────────────┐   │
//!                    │  │ Task    │ │ TaskStorage  │   │
//!                    │  │ Instance│ │ (changelog)  │   │
//!                    │  └─────────┘ └──────────────┘   │
//!                    └─────────────────────────────────┘
//!                                        │ outbound + changelog
//!                                        ▼
//!                         SystemProducers → messaging systems
//! ```
//!
//! Plugin seams (systems, codecs, stores, checkpoints, choosers, reporters,
//! listeners, tasks) resolve through a [`FactoryRegistry`] registration
//! table; config names factories, unknown names fail at setup.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod checkpoint;
pub mod codec;
pub mod container;
pub mod envelope;
pub mod metrics;
pub mod registry;
pub mod storage;
pub mod system;
pub mod task;
pub mod types;

// Internal utilities
pub mod observability;
pub(crate) mod util;

pub use container::{run_from_env, Container};
pub use registry::FactoryRegistry;
pub use types::{Config, Error, Result};
