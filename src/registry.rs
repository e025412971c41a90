//! Factory registry — the plugin table.
//!
//! Every pluggable seam (messaging systems, codecs, storage engines,
//! checkpoint backends, choosers, metrics reporters, lifecycle listeners,
//! and the task itself) resolves through this registration table. Config
//! values name factories; resolving an unregistered name is a setup-time
//! fatal error carrying both the config key and the unknown name.
//!
//! Embedders register their own factories next to the built-ins and hand
//! the registry to the container entry point.

use std::collections::HashMap;
use std::sync::Arc;

use crate::checkpoint::{
    CheckpointManagerFactory, FileCheckpointManagerFactory, InMemoryCheckpointManagerFactory,
};
use crate::codec::{JsonSerdeFactory, Serde, SerdeFactory, StringSerdeFactory};
use crate::metrics::{LogReporterFactory, MetricsReporterFactory};
use crate::storage::{
    FileSnapshotStoreFactory, MemoryKeyValueStoreFactory, StorageEngineFactory,
};
use crate::system::{ChooserFactory, InMemorySystemFactory, RoundRobinChooserFactory, SystemFactory};
use crate::task::{StreamTaskFactory, TaskLifecycleListenerFactory};
use crate::types::{Config, Error, Result, SerializerConfig};

#[derive(Default)]
pub struct FactoryRegistry {
    systems: HashMap<String, Arc<dyn SystemFactory>>,
    serdes: HashMap<String, Arc<dyn SerdeFactory>>,
    stores: HashMap<String, Arc<dyn StorageEngineFactory>>,
    checkpoints: HashMap<String, Arc<dyn CheckpointManagerFactory>>,
    choosers: HashMap<String, Arc<dyn ChooserFactory>>,
    reporters: HashMap<String, Arc<dyn MetricsReporterFactory>>,
    listeners: HashMap<String, Arc<dyn TaskLifecycleListenerFactory>>,
    tasks: HashMap<String, Arc<dyn StreamTaskFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with every built-in factory.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_system("in-memory", Arc::new(InMemorySystemFactory));
        registry.register_serde("json", Arc::new(JsonSerdeFactory));
        registry.register_serde("string", Arc::new(StringSerdeFactory));
        registry.register_store("in-memory", Arc::new(MemoryKeyValueStoreFactory));
        registry.register_store("file-snapshot", Arc::new(FileSnapshotStoreFactory));
        registry.register_checkpoint("file", Arc::new(FileCheckpointManagerFactory));
        registry.register_checkpoint(
            "in-memory",
            Arc::new(InMemoryCheckpointManagerFactory::default()),
        );
        registry.register_chooser("round-robin", Arc::new(RoundRobinChooserFactory));
        registry.register_reporter("log", Arc::new(LogReporterFactory));
        registry
    }

    // ---- registration ----

    pub fn register_system(&mut self, name: impl Into<String>, factory: Arc<dyn SystemFactory>) {
        self.systems.insert(name.into(), factory);
    }

    pub fn register_serde(&mut self, name: impl Into<String>, factory: Arc<dyn SerdeFactory>) {
        self.serdes.insert(name.into(), factory);
    }

    pub fn register_store(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn StorageEngineFactory>,
    ) {
        self.stores.insert(name.into(), factory);
    }

    pub fn register_checkpoint(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn CheckpointManagerFactory>,
    ) {
        self.checkpoints.insert(name.into(), factory);
    }

    pub fn register_chooser(&mut self, name: impl Into<String>, factory: Arc<dyn ChooserFactory>) {
        self.choosers.insert(name.into(), factory);
    }

    pub fn register_reporter(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn MetricsReporterFactory>,
    ) {
        self.reporters.insert(name.into(), factory);
    }

    pub fn register_listener(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn TaskLifecycleListenerFactory>,
    ) {
        self.listeners.insert(name.into(), factory);
    }

    pub fn register_task(&mut self, name: impl Into<String>, factory: Arc<dyn StreamTaskFactory>) {
        self.tasks.insert(name.into(), factory);
    }

    // ---- resolution (fatal on missing, naming key and value) ----

    pub fn system_factory(&self, key: &str, name: &str) -> Result<Arc<dyn SystemFactory>> {
        self.systems
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    pub fn serde_factory(&self, key: &str, name: &str) -> Result<Arc<dyn SerdeFactory>> {
        self.serdes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    pub fn store_factory(&self, key: &str, name: &str) -> Result<Arc<dyn StorageEngineFactory>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    pub fn checkpoint_factory(
        &self,
        key: &str,
        name: &str,
    ) -> Result<Arc<dyn CheckpointManagerFactory>> {
        self.checkpoints
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    pub fn chooser_factory(&self, key: &str, name: &str) -> Result<Arc<dyn ChooserFactory>> {
        self.choosers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    pub fn reporter_factory(&self, key: &str, name: &str) -> Result<Arc<dyn MetricsReporterFactory>> {
        self.reporters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    pub fn listener_factory(
        &self,
        key: &str,
        name: &str,
    ) -> Result<Arc<dyn TaskLifecycleListenerFactory>> {
        self.listeners
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    pub fn task_factory(&self, key: &str, name: &str) -> Result<Arc<dyn StreamTaskFactory>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::factory(key, name))
    }

    /// Resolve a codec *name* to a codec instance, honoring the
    /// `serializers.registry.<name>.factory` indirection.
    pub fn make_serde(&self, name: &str, config: &Config) -> Result<Arc<dyn Serde>> {
        let serializer_config = SerializerConfig::new(config);
        let factory_name = serializer_config.factory(name);
        let key = format!("serializers.registry.{}.factory", name);
        let factory = self.serde_factory(&key, factory_name)?;
        factory.make(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let registry = FactoryRegistry::with_defaults();
        assert!(registry
            .system_factory("systems.sys.factory", "in-memory")
            .is_ok());
        assert!(registry.serde_factory("k", "json").is_ok());
        assert!(registry.store_factory("k", "in-memory").is_ok());
        assert!(registry.checkpoint_factory("k", "file").is_ok());
        assert!(registry.chooser_factory("k", "round-robin").is_ok());
        assert!(registry.reporter_factory("k", "log").is_ok());
    }

    #[test]
    fn test_unknown_factory_names_key_and_value() {
        let registry = FactoryRegistry::with_defaults();
        let err = registry
            .system_factory("systems.kafka.factory", "kafka")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("systems.kafka.factory"));
        assert!(message.contains("kafka"));
    }

    #[test]
    fn test_serde_name_indirection() {
        let registry = FactoryRegistry::with_defaults();

        // Direct built-in name.
        let config = Config::default();
        assert!(registry.make_serde("json", &config).is_ok());

        // Explicit registry entry pointing a custom name at a factory.
        let config = Config::new(
            [(
                "serializers.registry.events.factory".to_string(),
                "json".to_string(),
            )]
            .into(),
        );
        assert!(registry.make_serde("events", &config).is_ok());

        // Unknown name with no registry entry fails, naming the key.
        let err = registry.make_serde("avro", &Config::default()).unwrap_err();
        assert!(err.to_string().contains("serializers.registry.avro.factory"));
    }
}
