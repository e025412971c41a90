//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The
//! variants follow the container's failure taxonomy: setup-time errors name
//! the offending config key or factory; runtime errors carry enough context
//! to locate the envelope or subsystem involved.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the stream container.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration. Always names the exact key.
    #[error("config error for key '{key}': {message}")]
    Config { key: String, message: String },

    /// A config value named a factory that is not registered.
    #[error("unknown factory '{name}' referenced by '{key}'")]
    Factory { key: String, name: String },

    /// Container or subsystem failed to wire up or start.
    #[error("setup error: {0}")]
    Setup(String),

    /// A codec failed to encode or decode one envelope.
    #[error("codec error for {context}: {message}")]
    Serde { context: String, message: String },

    /// User task code failed (error return or panic).
    #[error("task processing error: {0}")]
    Process(String),

    /// A commit could not complete; the checkpoint was not written.
    #[error("commit failed: {0}")]
    Commit(String),

    /// Changelog restore failed; the store is not consistent.
    #[error("store restore failed: {0}")]
    Restore(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn factory(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Factory {
            key: key.into(),
            name: name.into(),
        }
    }

    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn serde(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Serde {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn commit(msg: impl Into<String>) -> Self {
        Self::Commit(msg.into())
    }

    pub fn restore(msg: impl Into<String>) -> Self {
        Self::Restore(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_key() {
        let err = Error::config("task.inputs", "required key missing");
        assert!(err.to_string().contains("task.inputs"));
    }

    #[test]
    fn test_factory_error_names_key_and_value() {
        let err = Error::factory("systems.kafka.factory", "no-such-system");
        let msg = err.to_string();
        assert!(msg.contains("systems.kafka.factory"));
        assert!(msg.contains("no-such-system"));
    }
}
