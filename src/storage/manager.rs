//! Logged stores and per-task storage management.
//!
//! [`LoggedStore`] is the task-facing store: it applies the store's codecs
//! at the boundary and, when a changelog is configured, mirrors every
//! mutation to the changelog partition matching the task's partition —
//! through the shared producer multiplexer, *before* the engine applies it.
//! A commit's producer flush therefore drains all changelog writes the
//! engine has already acknowledged.
//!
//! [`TaskStorageManager`] owns one task's stores and runs the restore
//! protocol: before processing starts, each changelog is read from its
//! oldest offset to its head through a dedicated consumer and replayed
//! straight into the engine, bypassing the changelog write path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Serde;
use crate::envelope::{IncomingMessageEnvelope, OutgoingMessageEnvelope, Payload};
use crate::registry::FactoryRegistry;
use crate::storage::StorageEngine;
use crate::system::{SharedProducers, StartingOffset};
use crate::types::{
    Config, Error, Partition, Result, SystemConfig, SystemStreamPartition, TaskName,
};

/// Polls tolerated without progress before a restore is declared stuck.
const RESTORE_STALL_LIMIT: u32 = 50;
const RESTORE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct LoggedStore {
    name: String,
    engine: Box<dyn StorageEngine>,
    key_serde: Option<Arc<dyn Serde>>,
    msg_serde: Option<Arc<dyn Serde>>,
    changelog: Option<SystemStreamPartition>,
    producers: SharedProducers,
    source: String,
}

impl LoggedStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        engine: Box<dyn StorageEngine>,
        key_serde: Option<Arc<dyn Serde>>,
        msg_serde: Option<Arc<dyn Serde>>,
        changelog: Option<SystemStreamPartition>,
        producers: SharedProducers,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            engine,
            key_serde,
            msg_serde,
            changelog,
            producers,
            source: source.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn changelog(&self) -> Option<&SystemStreamPartition> {
        self.changelog.as_ref()
    }

    pub fn get(&self, key: &Payload) -> Result<Option<Payload>> {
        let key = self.encode(key.clone(), &self.key_serde, "key")?;
        Ok(self
            .engine
            .get(&key)?
            .map(|bytes| self.decode(bytes, &self.msg_serde)))
    }

    /// Write one entry. The changelog write precedes the engine apply, so a
    /// mutation is never acknowledged before it is replicable.
    pub async fn put(&mut self, key: Payload, value: Payload) -> Result<()> {
        let key = self.encode(key, &self.key_serde, "key")?;
        let value = self.encode(value, &self.msg_serde, "value")?;
        self.log_mutation(key.clone(), Some(value.clone())).await?;
        self.engine.put(key, value)
    }

    pub async fn delete(&mut self, key: Payload) -> Result<()> {
        let key = self.encode(key, &self.key_serde, "key")?;
        self.log_mutation(key.clone(), None).await?;
        self.engine.delete(&key)
    }

    /// Entries with keys in `[from, to)` under the store's key encoding.
    pub fn range(&self, from: &Payload, to: &Payload) -> Result<Vec<(Payload, Payload)>> {
        let from = self.encode(from.clone(), &self.key_serde, "key")?;
        let to = self.encode(to.clone(), &self.key_serde, "key")?;
        Ok(self
            .engine
            .range(&from, &to)?
            .into_iter()
            .map(|(k, v)| (self.decode(k, &self.key_serde), self.decode(v, &self.msg_serde)))
            .collect())
    }

    pub fn all(&self) -> Result<Vec<(Payload, Payload)>> {
        Ok(self
            .engine
            .all()?
            .into_iter()
            .map(|(k, v)| (self.decode(k, &self.key_serde), self.decode(v, &self.msg_serde)))
            .collect())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.engine.flush()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.engine.stop()
    }

    async fn log_mutation(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
        let Some(ssp) = &self.changelog else {
            return Ok(());
        };
        let envelope = OutgoingMessageEnvelope::raw(
            ssp.system_stream.clone(),
            Some(ssp.partition),
            Some(key),
            value,
        );
        self.producers.send(&self.source, envelope).await
    }

    /// Apply one replayed changelog entry directly to the engine.
    fn apply_restore(&mut self, envelope: IncomingMessageEnvelope) -> Result<()> {
        let key = envelope
            .key
            .and_then(Payload::into_raw)
            .ok_or_else(|| Error::restore(format!("changelog entry for store '{}' has no key", self.name)))?;
        let value = envelope.value.and_then(Payload::into_raw);
        self.engine.restore(key, value)
    }

    fn encode(&self, payload: Payload, serde: &Option<Arc<dyn Serde>>, side: &str) -> Result<Vec<u8>> {
        match (payload, serde) {
            (Payload::Raw(bytes), _) => Ok(bytes),
            (Payload::Typed(value), Some(serde)) => serde.encode(&value),
            (Payload::Typed(_), None) => Err(Error::serde(
                format!("{} of store '{}'", side, self.name),
                "typed payload but the store has no codec configured",
            )),
        }
    }

    fn decode(&self, bytes: Vec<u8>, serde: &Option<Arc<dyn Serde>>) -> Payload {
        match serde {
            Some(serde) => match serde.decode(&bytes) {
                Ok(value) => Payload::Typed(value),
                // Stored bytes that no longer decode surface raw rather
                // than failing reads wholesale.
                Err(_) => Payload::Raw(bytes),
            },
            None => Payload::Raw(bytes),
        }
    }
}

pub struct TaskStorageManager {
    task_name: TaskName,
    partition: Partition,
    stores: HashMap<String, LoggedStore>,
}

impl TaskStorageManager {
    pub fn new(task_name: TaskName, partition: Partition, stores: HashMap<String, LoggedStore>) -> Self {
        Self {
            task_name,
            partition,
            stores,
        }
    }

    pub fn store_mut(&mut self, name: &str) -> Option<&mut LoggedStore> {
        self.stores.get_mut(name)
    }

    pub fn store(&self, name: &str) -> Option<&LoggedStore> {
        self.stores.get(name)
    }

    pub fn store_names(&self) -> Vec<&str> {
        self.stores.keys().map(String::as_str).collect()
    }

    /// Rebuild every changelog-backed store before processing begins.
    ///
    /// Each changelog partition is read through a dedicated consumer from
    /// its oldest offset until the head observed at restore start. Entries
    /// are applied raw, bypassing the changelog write path, so restore
    /// never amplifies the changelog.
    pub async fn restore_all(&mut self, config: &Config, registry: &FactoryRegistry) -> Result<()> {
        let system_config = SystemConfig::new(config);
        for store in self.stores.values_mut() {
            let Some(ssp) = store.changelog().cloned() else {
                continue;
            };

            let factory_key = SystemConfig::factory_key(ssp.system());
            let factory_name = system_config.factory(ssp.system())?;
            let factory = registry.system_factory(&factory_key, factory_name)?;

            let admin = factory
                .admin(ssp.system(), config)
                .map_err(|e| Error::restore(e.to_string()))?;
            let metadata = admin
                .stream_metadata(&[ssp.stream()])
                .map_err(|e| Error::restore(e.to_string()))?;
            let head = metadata
                .get(ssp.stream())
                .and_then(|m| m.partitions.get(&ssp.partition))
                .and_then(|p| p.newest.clone());

            let Some(head) = head else {
                tracing::info!(
                    task = %self.task_name,
                    store = store.name(),
                    changelog = %ssp,
                    "changelog empty, nothing to restore"
                );
                continue;
            };

            let mut consumer = factory
                .consumer(ssp.system(), config)
                .map_err(|e| Error::restore(e.to_string()))?;
            consumer.register(ssp.clone(), StartingOffset::Earliest);
            consumer
                .start()
                .await
                .map_err(|e| Error::restore(e.to_string()))?;

            let wanted: HashSet<SystemStreamPartition> = [ssp.clone()].into();
            let mut restored = 0u64;
            let mut stalls = 0u32;
            let mut reached_head = false;
            while !reached_head {
                let mut batches = consumer
                    .poll(&wanted, RESTORE_POLL_TIMEOUT)
                    .await
                    .map_err(|e| Error::restore(e.to_string()))?;
                let envelopes = batches.remove(&ssp).unwrap_or_default();
                if envelopes.is_empty() {
                    stalls += 1;
                    if stalls >= RESTORE_STALL_LIMIT {
                        return Err(Error::restore(format!(
                            "changelog {} stalled before reaching head offset {}",
                            ssp, head
                        )));
                    }
                    continue;
                }
                stalls = 0;
                for envelope in envelopes {
                    if envelope.offset == head {
                        reached_head = true;
                    }
                    store.apply_restore(envelope)?;
                    restored += 1;
                }
            }

            consumer
                .stop()
                .await
                .map_err(|e| Error::restore(e.to_string()))?;
            tracing::info!(
                task = %self.task_name,
                store = store.name(),
                changelog = %ssp,
                records = restored,
                "store restored from changelog"
            );
        }
        Ok(())
    }

    /// Flush every store; first step of the commit protocol.
    pub fn flush_all(&mut self) -> Result<()> {
        for store in self.stores.values_mut() {
            store
                .flush()
                .map_err(|e| Error::commit(format!("store '{}' flush failed: {}", store.name, e)))?;
        }
        Ok(())
    }

    pub fn stop_all(&mut self) {
        for store in self.stores.values_mut() {
            if let Err(e) = store.stop() {
                tracing::error!(task = %self.task_name, store = store.name(), error = %e, "store failed to stop");
            }
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonSerde, SerdeManager};
    use crate::metrics::MetricsRegistry;
    use crate::storage::MemoryKeyValueStore;
    use crate::system::{InMemoryBroker, SystemProducers};
    use crate::types::SystemStream;
    use serde_json::json;

    fn logged_store(
        changelog: Option<SystemStreamPartition>,
        producers: SharedProducers,
    ) -> LoggedStore {
        LoggedStore::new(
            "kv",
            Box::new(MemoryKeyValueStore::new()),
            Some(Arc::new(JsonSerde)),
            Some(Arc::new(JsonSerde)),
            changelog,
            producers,
            "partition-0",
        )
    }

    fn producers_for(scope: &str) -> SharedProducers {
        let factory = crate::system::InMemorySystemFactory;
        let config = Config::new(
            [
                ("systems.sys.factory".to_string(), "in-memory".to_string()),
                ("systems.sys.inmemory.scope".to_string(), scope.to_string()),
            ]
            .into(),
        );
        let producer = crate::system::SystemFactory::producer(&factory, "sys", &config).unwrap();
        let mut serdes = SerdeManager::new();
        serdes.register_changelog(SystemStream::new("sys", "kv-log"));
        let registry = MetricsRegistry::new("test");
        let mut map = HashMap::new();
        map.insert("sys".to_string(), producer);
        let mut producers = SystemProducers::new(map, Arc::new(serdes), &registry);
        producers.register("partition-0");
        SharedProducers::new(producers)
    }

    fn unique_scope(label: &str) -> String {
        format!("{}-{}", label, uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn test_put_mirrors_to_changelog_before_apply() {
        let scope = unique_scope("logged");
        let producers = producers_for(&scope);
        let ssp = SystemStreamPartition::new("sys", "kv-log", Partition::new(0));
        let mut store = logged_store(Some(ssp), producers);

        store
            .put(Payload::typed(json!("k")), Payload::typed(json!("v")))
            .await
            .unwrap();

        // The changelog received the encoded entry on the task's partition.
        let broker = InMemoryBroker::scope(&scope);
        let messages = broker.messages("kv-log", Partition::new(0));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.as_deref(), Some(&b"\"k\""[..]));
        assert_eq!(messages[0].value.as_deref(), Some(&b"\"v\""[..]));

        // The store reflects the write.
        let value = store.get(&Payload::typed(json!("k"))).unwrap().unwrap();
        assert_eq!(value.as_value(), Some(&json!("v")));
    }

    #[tokio::test]
    async fn test_delete_logs_tombstone() {
        let scope = unique_scope("tombstone");
        let producers = producers_for(&scope);
        let ssp = SystemStreamPartition::new("sys", "kv-log", Partition::new(0));
        let mut store = logged_store(Some(ssp), producers);

        store
            .put(Payload::typed(json!("k")), Payload::typed(json!("v")))
            .await
            .unwrap();
        store.delete(Payload::typed(json!("k"))).await.unwrap();

        let broker = InMemoryBroker::scope(&scope);
        let messages = broker.messages("kv-log", Partition::new(0));
        assert_eq!(messages.len(), 2);
        assert!(messages[1].value.is_none());
        assert!(store.get(&Payload::typed(json!("k"))).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlogged_store_writes_nothing() {
        let scope = unique_scope("unlogged");
        let producers = producers_for(&scope);
        let mut store = logged_store(None, producers);

        store
            .put(Payload::typed(json!("k")), Payload::typed(json!("v")))
            .await
            .unwrap();

        let broker = InMemoryBroker::scope(&scope);
        assert!(broker.messages("kv-log", Partition::new(0)).is_empty());
    }

    #[tokio::test]
    async fn test_restore_replays_changelog_without_amplification() {
        let scope = unique_scope("restore");
        let broker = InMemoryBroker::scope(&scope);
        broker.seed(
            "kv-log",
            Partition::new(0),
            0,
            vec![
                crate::system::StoredMessage {
                    key: Some(b"\"k\"".to_vec()),
                    value: Some(b"\"v1\"".to_vec()),
                },
                crate::system::StoredMessage {
                    key: Some(b"\"k\"".to_vec()),
                    value: Some(b"\"v2\"".to_vec()),
                },
            ],
        );

        let producers = producers_for(&scope);
        let ssp = SystemStreamPartition::new("sys", "kv-log", Partition::new(0));
        let store = logged_store(Some(ssp), producers);
        let mut manager = TaskStorageManager::new(
            TaskName::for_partition(Partition::new(0)),
            Partition::new(0),
            [("kv".to_string(), store)].into(),
        );

        let config = Config::new(
            [
                ("systems.sys.factory".to_string(), "in-memory".to_string()),
                ("systems.sys.inmemory.scope".to_string(), scope.clone()),
            ]
            .into(),
        );
        let registry = FactoryRegistry::with_defaults();
        manager.restore_all(&config, &registry).await.unwrap();

        // Last write wins, and the replay produced no new changelog writes.
        let store = manager.store("kv").unwrap();
        let value = store.get(&Payload::typed(json!("k"))).unwrap().unwrap();
        assert_eq!(value.as_value(), Some(&json!("v2")));
        assert_eq!(broker.messages("kv-log", Partition::new(0)).len(), 2);
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let scope = unique_scope("restore-twice");
        let broker = InMemoryBroker::scope(&scope);
        broker.seed(
            "kv-log",
            Partition::new(0),
            0,
            vec![crate::system::StoredMessage {
                key: Some(b"\"k\"".to_vec()),
                value: Some(b"\"v\"".to_vec()),
            }],
        );

        let config = Config::new(
            [
                ("systems.sys.factory".to_string(), "in-memory".to_string()),
                ("systems.sys.inmemory.scope".to_string(), scope.clone()),
            ]
            .into(),
        );
        let registry = FactoryRegistry::with_defaults();
        let ssp = SystemStreamPartition::new("sys", "kv-log", Partition::new(0));

        let mut states = Vec::new();
        for _ in 0..2 {
            let producers = producers_for(&scope);
            let store = logged_store(Some(ssp.clone()), producers);
            let mut manager = TaskStorageManager::new(
                TaskName::for_partition(Partition::new(0)),
                Partition::new(0),
                [("kv".to_string(), store)].into(),
            );
            manager.restore_all(&config, &registry).await.unwrap();
            states.push(manager.store("kv").unwrap().all().unwrap());
        }
        assert_eq!(states[0], states[1]);
    }

    #[tokio::test]
    async fn test_restore_with_empty_changelog_is_noop() {
        let scope = unique_scope("restore-empty");
        let producers = producers_for(&scope);
        let ssp = SystemStreamPartition::new("sys", "kv-log", Partition::new(0));
        let store = logged_store(Some(ssp), producers);
        let mut manager = TaskStorageManager::new(
            TaskName::for_partition(Partition::new(0)),
            Partition::new(0),
            [("kv".to_string(), store)].into(),
        );

        let config = Config::new(
            [
                ("systems.sys.factory".to_string(), "in-memory".to_string()),
                ("systems.sys.inmemory.scope".to_string(), scope),
            ]
            .into(),
        );
        let registry = FactoryRegistry::with_defaults();
        manager.restore_all(&config, &registry).await.unwrap();
        assert!(manager.store("kv").unwrap().all().unwrap().is_empty());
    }
}
