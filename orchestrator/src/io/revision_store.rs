//! Durable per-task revision records.
//!
//! The store is a blind last-writer-wins map keyed by task id. It does not
//! order rounds; the engine refuses to save a record older than the stored one
//! before calling [`RevisionStore::save`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::naming::task_key;
use crate::core::types::RevisionRecord;

pub trait RevisionStore: Send + Sync {
    /// Last successful record for `task_id`; `None` means first round.
    fn load(&self, task_id: &str) -> Result<Option<RevisionRecord>>;

    /// Overwrite the record for `task_id` unconditionally.
    fn save(&self, task_id: &str, record: &RevisionRecord) -> Result<()>;
}

/// One JSON file per task under `.orchestrator/revisions/`.
#[derive(Debug, Clone)]
pub struct FileRevisionStore {
    dir: PathBuf,
}

impl FileRevisionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_key(task_id)))
    }
}

impl RevisionStore for FileRevisionStore {
    fn load(&self, task_id: &str) -> Result<Option<RevisionRecord>> {
        let path = self.record_path(task_id);
        if !path.exists() {
            debug!(task_id, "no revision record");
            return Ok(None);
        }
        let record = read_record(&path)?;
        if record.task_id != task_id {
            return Err(anyhow!(
                "revision record {} belongs to task '{}', not '{task_id}'",
                path.display(),
                record.task_id
            ));
        }
        debug!(task_id, last_round = record.last_round, "revision record loaded");
        Ok(Some(record))
    }

    fn save(&self, task_id: &str, record: &RevisionRecord) -> Result<()> {
        if record.task_id != task_id {
            return Err(anyhow!(
                "refusing to save record for task '{}' under '{task_id}'",
                record.task_id
            ));
        }
        let path = self.record_path(task_id);
        debug!(task_id, last_round = record.last_round, path = %path.display(), "saving revision record");
        super::write_json_atomic(&path, record)
            .with_context(|| format!("save revision record {}", path.display()))
    }
}

fn read_record(path: &Path) -> Result<RevisionRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Process-local store, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryRevisionStore {
    records: Mutex<HashMap<String, RevisionRecord>>,
}

impl InMemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: RevisionRecord) -> Self {
        let store = Self::default();
        if let Ok(mut records) = store.records.lock() {
            records.insert(record.task_id.clone(), record);
        }
        store
    }
}

impl RevisionStore for InMemoryRevisionStore {
    fn load(&self, task_id: &str) -> Result<Option<RevisionRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow!("revision store lock poisoned"))?;
        Ok(records.get(task_id).cloned())
    }

    fn save(&self, task_id: &str, record: &RevisionRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("revision store lock poisoned"))?;
        records.insert(task_id.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::revision;

    #[test]
    fn file_store_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRevisionStore::new(temp.path());
        let record = revision("Captcha Solver", 2);

        store.save("Captcha Solver", &record).expect("save");
        let loaded = store.load("Captcha Solver").expect("load");
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn file_store_missing_task_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRevisionStore::new(temp.path());
        assert_eq!(store.load("never-seen").expect("load"), None);
    }

    #[test]
    fn save_overwrites_blindly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRevisionStore::new(temp.path());
        store.save("t", &revision("t", 3)).expect("save");
        store.save("t", &revision("t", 1)).expect("save lower round");

        let loaded = store.load("t").expect("load").expect("record");
        assert_eq!(loaded.last_round, 1);
    }

    #[test]
    fn similar_ids_do_not_share_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRevisionStore::new(temp.path());
        assert_ne!(store.record_path("Task A"), store.record_path("task-a"));

        store.save("Task A", &revision("Task A", 1)).expect("save");
        assert_eq!(store.load("task-a").expect("load"), None);
    }

    #[test]
    fn refuses_mismatched_task_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRevisionStore::new(temp.path());
        assert!(store.save("a", &revision("b", 1)).is_err());
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryRevisionStore::new();
        let record = revision("t", 4);
        store.save("t", &record).expect("save");
        assert_eq!(store.load("t").expect("load"), Some(record));
        assert_eq!(store.load("other").expect("load"), None);
    }
}
