//! Checkpoints and checkpoint backends.
//!
//! A checkpoint maps each of a task's input partitions to the offset of the
//! **last processed** envelope (inclusive); consumers resume *after* the
//! checkpointed offset. That convention holds everywhere in this crate.
//!
//! The backend is an optional capability: a container configured without
//! `task.checkpoint.factory` runs with no checkpointing and every stream
//! starts from its reset policy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Config, Error, Offset, Partition, Result, SystemStreamPartition, TaskConfig, TaskName,
};

/// One task's committed read positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last processed offset per input partition, inclusive.
    pub offsets: BTreeMap<SystemStreamPartition, Offset>,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(offsets: BTreeMap<SystemStreamPartition, Offset>) -> Self {
        Self {
            offsets,
            written_at: Utc::now(),
        }
    }

    pub fn offset(&self, ssp: &SystemStreamPartition) -> Option<&Offset> {
        self.offsets.get(ssp)
    }
}

/// Durable storage for checkpoints. Only the most recent write per task is
/// authoritative.
pub trait CheckpointManager: Send {
    fn start(&mut self) -> Result<()>;

    /// Announce a task before reads or writes. Called once per task.
    fn register(&mut self, task: &TaskName);

    /// Persist atomically; a torn write must never replace a previous
    /// checkpoint with a partial one.
    fn write(&mut self, task: &TaskName, checkpoint: &Checkpoint) -> Result<()>;

    fn read_last(&mut self, task: &TaskName) -> Result<Option<Checkpoint>>;

    fn stop(&mut self) -> Result<()>;
}

pub trait CheckpointManagerFactory: Send + Sync {
    fn make(&self, config: &Config) -> Result<Box<dyn CheckpointManager>>;
}

// =============================================================================
// File backend
// =============================================================================

#[derive(Serialize, Deserialize)]
struct CheckpointEntry {
    system: String,
    stream: String,
    partition: u32,
    offset: String,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    written_at: DateTime<Utc>,
    offsets: Vec<CheckpointEntry>,
}

impl From<&Checkpoint> for CheckpointFile {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            written_at: checkpoint.written_at,
            offsets: checkpoint
                .offsets
                .iter()
                .map(|(ssp, offset)| CheckpointEntry {
                    system: ssp.system().to_string(),
                    stream: ssp.stream().to_string(),
                    partition: ssp.partition.id(),
                    offset: offset.as_str().to_string(),
                })
                .collect(),
        }
    }
}

impl From<CheckpointFile> for Checkpoint {
    fn from(file: CheckpointFile) -> Self {
        Self {
            written_at: file.written_at,
            offsets: file
                .offsets
                .into_iter()
                .map(|entry| {
                    (
                        SystemStreamPartition::new(
                            entry.system,
                            entry.stream,
                            Partition::new(entry.partition),
                        ),
                        Offset::from(entry.offset),
                    )
                })
                .collect(),
        }
    }
}

/// One JSON document per task under `task.checkpoint.path`, replaced with a
/// temp-file-plus-rename so readers never observe a torn write.
pub struct FileCheckpointManager {
    dir: PathBuf,
    registered: HashSet<TaskName>,
}

impl FileCheckpointManager {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            registered: HashSet::new(),
        }
    }

    fn path_for(&self, task: &TaskName) -> PathBuf {
        self.dir.join(format!("{}.json", task))
    }
}

impl CheckpointManager for FileCheckpointManager {
    fn start(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn register(&mut self, task: &TaskName) {
        self.registered.insert(task.clone());
    }

    fn write(&mut self, task: &TaskName, checkpoint: &Checkpoint) -> Result<()> {
        debug_assert!(self.registered.contains(task), "write for unregistered task");
        let file = CheckpointFile::from(checkpoint);
        let raw = serde_json::to_vec_pretty(&file)?;
        let path = self.path_for(task);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(task = %task, offsets = checkpoint.offsets.len(), "checkpoint written");
        Ok(())
    }

    fn read_last(&mut self, task: &TaskName) -> Result<Option<Checkpoint>> {
        let path = self.path_for(task);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        let file: CheckpointFile = serde_json::from_slice(&raw)
            .map_err(|e| Error::setup(format!("corrupt checkpoint {}: {}", path.display(), e)))?;
        Ok(Some(file.into()))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct FileCheckpointManagerFactory;

impl CheckpointManagerFactory for FileCheckpointManagerFactory {
    fn make(&self, config: &Config) -> Result<Box<dyn CheckpointManager>> {
        Ok(Box::new(FileCheckpointManager::new(
            TaskConfig::new(config).checkpoint_path(),
        )))
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Shared checkpoint history, inspectable by the owner of the factory.
pub type CheckpointHistory = Arc<Mutex<HashMap<TaskName, Vec<Checkpoint>>>>;

/// Ephemeral backend for tests and single-run containers. Keeps the full
/// write history per task; `read_last` returns the latest write.
pub struct InMemoryCheckpointManager {
    history: CheckpointHistory,
}

impl InMemoryCheckpointManager {
    pub fn with_history(history: CheckpointHistory) -> Self {
        Self { history }
    }
}

impl CheckpointManager for InMemoryCheckpointManager {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn register(&mut self, task: &TaskName) {
        self.history
            .lock()
            .expect("checkpoint history poisoned")
            .entry(task.clone())
            .or_default();
    }

    fn write(&mut self, task: &TaskName, checkpoint: &Checkpoint) -> Result<()> {
        self.history
            .lock()
            .expect("checkpoint history poisoned")
            .entry(task.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    fn read_last(&mut self, task: &TaskName) -> Result<Option<Checkpoint>> {
        Ok(self
            .history
            .lock()
            .expect("checkpoint history poisoned")
            .get(task)
            .and_then(|writes| writes.last().cloned()))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory whose managers all share one inspectable history.
#[derive(Default)]
pub struct InMemoryCheckpointManagerFactory {
    history: CheckpointHistory,
}

impl InMemoryCheckpointManagerFactory {
    pub fn history(&self) -> CheckpointHistory {
        Arc::clone(&self.history)
    }
}

impl CheckpointManagerFactory for InMemoryCheckpointManagerFactory {
    fn make(&self, _config: &Config) -> Result<Box<dyn CheckpointManager>> {
        Ok(Box::new(InMemoryCheckpointManager::with_history(
            Arc::clone(&self.history),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(offset: &str) -> Checkpoint {
        Checkpoint::new(
            [(
                SystemStreamPartition::new("sys", "s", Partition::new(0)),
                Offset::from(offset),
            )]
            .into(),
        )
    }

    #[test]
    fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = FileCheckpointManager::new(dir.path().to_path_buf());
        manager.start().unwrap();

        let task = TaskName::for_partition(Partition::new(0));
        manager.register(&task);
        assert!(manager.read_last(&task).unwrap().is_none());

        let written = checkpoint("12");
        manager.write(&task, &written).unwrap();
        let read = manager.read_last(&task).unwrap().unwrap();
        assert_eq!(read.offsets, written.offsets);
    }

    #[test]
    fn test_file_backend_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = FileCheckpointManager::new(dir.path().to_path_buf());
        manager.start().unwrap();
        let task = TaskName::for_partition(Partition::new(0));
        manager.register(&task);

        manager.write(&task, &checkpoint("10")).unwrap();
        manager.write(&task, &checkpoint("11")).unwrap();

        let read = manager.read_last(&task).unwrap().unwrap();
        let ssp = SystemStreamPartition::new("sys", "s", Partition::new(0));
        assert_eq!(read.offset(&ssp).unwrap().as_str(), "11");

        // No temp files survive the atomic replace.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_tasks_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = FileCheckpointManager::new(dir.path().to_path_buf());
        manager.start().unwrap();

        let task0 = TaskName::for_partition(Partition::new(0));
        let task1 = TaskName::for_partition(Partition::new(1));
        manager.register(&task0);
        manager.register(&task1);

        manager.write(&task0, &checkpoint("5")).unwrap();
        assert!(manager.read_last(&task1).unwrap().is_none());
    }

    #[test]
    fn test_in_memory_backend_keeps_history() {
        let factory = InMemoryCheckpointManagerFactory::default();
        let history = factory.history();
        let mut manager = factory.make(&Config::default()).unwrap();

        let task = TaskName::for_partition(Partition::new(0));
        manager.register(&task);
        manager.write(&task, &checkpoint("1")).unwrap();
        manager.write(&task, &checkpoint("2")).unwrap();

        assert_eq!(
            manager.read_last(&task).unwrap().unwrap().offsets,
            checkpoint("2").offsets
        );
        assert_eq!(history.lock().unwrap()[&task].len(), 2);
    }
}
