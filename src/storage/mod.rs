//! Embedded key-value storage engines.
//!
//! An engine is byte-keyed and byte-valued; codecs are applied a layer up by
//! the logged store. `restore` is the raw replay entry point used while
//! rebuilding a store from its changelog — it must never feed back into the
//! changelog write path.

pub mod manager;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Config, Partition, Result};

pub use manager::{LoggedStore, TaskStorageManager};

pub trait StorageEngine: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Entries with keys in `[from, to)`, ordered by key.
    fn range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// All entries, ordered by key.
    fn all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply one changelog entry directly; `None` means delete.
    fn restore(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}

pub trait StorageEngineFactory: Send + Sync {
    fn make(
        &self,
        store: &str,
        partition: Partition,
        store_dir: &Path,
        config: &Config,
    ) -> Result<Box<dyn StorageEngine>>;
}

// =============================================================================
// In-memory engine
// =============================================================================

/// Ordered in-memory engine. State lives and dies with the process; the
/// changelog is its only durability.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.map.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    fn range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map
            .range(from.to_vec()..to.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn restore(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
        match value {
            Some(value) => self.map.insert(key, value),
            None => self.map.remove(&key),
        };
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryKeyValueStoreFactory;

impl StorageEngineFactory for MemoryKeyValueStoreFactory {
    fn make(
        &self,
        _store: &str,
        _partition: Partition,
        _store_dir: &Path,
        _config: &Config,
    ) -> Result<Box<dyn StorageEngine>> {
        Ok(Box::new(MemoryKeyValueStore::new()))
    }
}

// =============================================================================
// File-snapshot engine
// =============================================================================

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// In-memory map persisted as one JSON snapshot per flush, under the
/// container's state layout (`<state-dir>/<store>/<partition>/`). Loads the
/// snapshot on open so warm restarts skip most of the changelog replay work
/// the restore pass would otherwise redo.
pub struct FileSnapshotStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    path: PathBuf,
    dirty: bool,
}

impl FileSnapshotStore {
    const SNAPSHOT_FILE: &'static str = "snapshot.json";

    pub fn open(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(Self::SNAPSHOT_FILE);
        let map = if path.exists() {
            let raw = std::fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)?;
            snapshot.entries.into_iter().collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            map,
            path,
            dirty: false,
        })
    }

    fn write_snapshot(&self) -> Result<()> {
        let snapshot = Snapshot {
            entries: self.map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let raw = serde_json::to_vec(&snapshot)?;
        // Write-then-rename so a crash mid-flush never truncates the
        // previous snapshot.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageEngine for FileSnapshotStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.map.insert(key, value);
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.dirty |= self.map.remove(key).is_some();
        Ok(())
    }

    fn range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map
            .range(from.to_vec()..to.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn restore(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
        match value {
            Some(value) => {
                self.map.insert(key, value);
            }
            None => {
                self.map.remove(&key);
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.write_snapshot()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.flush()
    }
}

pub struct FileSnapshotStoreFactory;

impl StorageEngineFactory for FileSnapshotStoreFactory {
    fn make(
        &self,
        _store: &str,
        _partition: Partition,
        store_dir: &Path,
        _config: &Config,
    ) -> Result<Box<dyn StorageEngine>> {
        Ok(Box::new(FileSnapshotStore::open(store_dir)?))
    }
}
