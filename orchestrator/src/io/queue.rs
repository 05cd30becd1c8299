//! File spool of admitted requests under `.orchestrator/queue/`.
//!
//! Each request is one JSON file named `<admitted-ms>-<task-slug>-r<round>.json`
//! so a directory listing sorts in admission order. Processed files move to
//! `done/`, unreadable ones to `rejected/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::admit::TaskRequest;
use crate::core::naming::slugify;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub admitted_at: DateTime<Utc>,
    pub request: TaskRequest,
}

/// A claimed queue entry.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub path: PathBuf,
    pub envelope: QueueEnvelope,
}

#[derive(Debug, Clone)]
pub struct SpoolQueue {
    dir: PathBuf,
}

impl SpoolQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn done_dir(&self) -> PathBuf {
        self.dir.join("done")
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.dir.join("rejected")
    }

    pub fn enqueue(&self, request: &TaskRequest, admitted_at: DateTime<Utc>) -> Result<PathBuf> {
        let stem = format!(
            "{:013}-{}-r{}",
            admitted_at.timestamp_millis(),
            slugify(&request.task),
            request.round
        );
        let path = self.free_path(&stem);
        let envelope = QueueEnvelope {
            admitted_at,
            request: request.clone(),
        };
        super::write_json_atomic(&path, &envelope)?;
        info!(
            task_id = %request.task,
            round = request.round,
            path = %path.display(),
            "enqueued"
        );
        Ok(path)
    }

    /// Pending entries in file-name order. Entries that fail to parse are
    /// moved to `rejected/` and skipped.
    pub fn pending(&self) -> Result<Vec<QueuedRequest>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?
        {
            let path = entry
                .with_context(|| format!("read entry in {}", self.dir.display()))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut claimed = Vec::with_capacity(paths.len());
        for path in paths {
            match read_envelope(&path) {
                Ok(envelope) => claimed.push(QueuedRequest { path, envelope }),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        err = %format!("{err:#}"),
                        "rejecting queue entry"
                    );
                    move_into(&path, &self.rejected_dir())?;
                }
            }
        }
        Ok(claimed)
    }

    /// Move a processed entry to `done/`.
    pub fn complete(&self, item: &QueuedRequest) -> Result<PathBuf> {
        move_into(&item.path, &self.done_dir())
    }

    fn free_path(&self, stem: &str) -> PathBuf {
        let mut path = self.dir.join(format!("{stem}.json"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}-{n}.json"));
            n += 1;
        }
        path
    }
}

fn read_envelope(path: &Path) -> Result<QueueEnvelope> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn move_into(path: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("queue entry without file name: {}", path.display()))?;
    let target = dir.join(name);
    fs::rename(path, &target)
        .with_context(|| format!("move {} to {}", path.display(), target.display()))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task: &str, round: u32) -> TaskRequest {
        TaskRequest {
            email: "student@example.com".to_string(),
            secret: "s3cret".to_string(),
            task: task.to_string(),
            round,
            nonce: format!("n-{round}"),
            brief: "Build it".to_string(),
            checks: Vec::new(),
            evaluation_url: "https://eval.test/notify".to_string(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn enqueue_names_files_by_admission_task_and_round() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = SpoolQueue::new(temp.path());
        let admitted_at = DateTime::from_timestamp_millis(1_700_000_000_000).expect("timestamp");

        let path = queue
            .enqueue(&request("Captcha Solver", 2), admitted_at)
            .expect("enqueue");
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("1700000000000-captcha-solver-r2.json")
        );

        let again = queue
            .enqueue(&request("Captcha Solver", 2), admitted_at)
            .expect("enqueue duplicate");
        assert_ne!(path, again);
    }

    #[test]
    fn pending_lists_in_admission_order_and_rejects_garbage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = SpoolQueue::new(temp.path());
        let later = DateTime::from_timestamp_millis(2_000).expect("timestamp");
        let earlier = DateTime::from_timestamp_millis(1_000).expect("timestamp");
        queue.enqueue(&request("b", 1), later).expect("enqueue b");
        queue.enqueue(&request("a", 1), earlier).expect("enqueue a");
        fs::write(temp.path().join("0-broken.json"), "{").expect("write garbage");

        let pending = queue.pending().expect("pending");
        let tasks: Vec<_> = pending
            .iter()
            .map(|item| item.envelope.request.task.as_str())
            .collect();
        assert_eq!(tasks, vec!["a", "b"]);
        assert!(queue.rejected_dir().join("0-broken.json").is_file());
    }

    #[test]
    fn complete_moves_entry_to_done() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = SpoolQueue::new(temp.path());
        queue.enqueue(&request("a", 1), Utc::now()).expect("enqueue");

        let pending = queue.pending().expect("pending");
        let done = queue.complete(&pending[0]).expect("complete");
        assert!(done.starts_with(queue.done_dir()));
        assert!(queue.pending().expect("pending").is_empty());
    }
}
