//! Internal utilities.

pub mod recovery;

pub use recovery::with_recovery_async;
