//! Per-run journal under `.orchestrator/runs/<task>/<round>/`.
//!
//! The journal keeps the admitted descriptor, the sealed notification body and
//! the run report, so a run can be inspected or its notification re-sent.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::naming::task_key;
use crate::core::types::{RunDescriptor, SealedPayload};

/// Descriptor fields as journaled; the monotonic deadline is not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JournaledDescriptor {
    pub task_id: String,
    pub round: u32,
    pub nonce: String,
    pub email: String,
    pub evaluation_url: String,
    pub admitted_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub descriptor_path: PathBuf,
    pub payload_path: PathBuf,
    pub report_path: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, task_id: &str, round: u32) -> Self {
        let dir = runs_dir.join(task_key(task_id)).join(round.to_string());
        Self {
            dir: dir.clone(),
            descriptor_path: dir.join("descriptor.json"),
            payload_path: dir.join("payload.json"),
            report_path: dir.join("report.json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunJournal {
    runs_dir: PathBuf,
}

impl RunJournal {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn paths(&self, task_id: &str, round: u32) -> RunPaths {
        RunPaths::new(&self.runs_dir, task_id, round)
    }

    pub fn write_descriptor(&self, descriptor: &RunDescriptor) -> Result<RunPaths> {
        let paths = self.paths(&descriptor.task_id, descriptor.round);
        super::write_json_atomic(&paths.descriptor_path, descriptor)?;
        debug!(dir = %paths.dir.display(), "journaled descriptor");
        Ok(paths)
    }

    /// Store the sealed body exactly as it goes on the wire.
    pub fn write_payload(&self, task_id: &str, round: u32, payload: &SealedPayload) -> Result<()> {
        let paths = self.paths(task_id, round);
        super::write_atomic(&paths.payload_path, payload.body())
    }

    pub fn write_report<T: Serialize>(&self, task_id: &str, round: u32, report: &T) -> Result<()> {
        let paths = self.paths(task_id, round);
        super::write_json_atomic(&paths.report_path, report)
    }

    pub fn read_descriptor(&self, task_id: &str, round: u32) -> Result<JournaledDescriptor> {
        let path = self.paths(task_id, round).descriptor_path;
        let contents = read_text(&path)?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    pub fn read_payload(&self, task_id: &str, round: u32) -> Result<SealedPayload> {
        let path = self.paths(task_id, round).payload_path;
        SealedPayload::from_body(read_text(&path)?)
            .with_context(|| format!("parse {}", path.display()))
    }

    /// The body journaled for this round, if one was sealed.
    pub fn stored_payload(&self, task_id: &str, round: u32) -> Result<Option<SealedPayload>> {
        if !self.paths(task_id, round).payload_path.is_file() {
            return Ok(None);
        }
        self.read_payload(task_id, round).map(Some)
    }

    pub fn read_report(&self, task_id: &str, round: u32) -> Result<serde_json::Value> {
        let path = self.paths(task_id, round).report_path;
        let contents = read_text(&path)?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Journaled rounds for a task, ascending.
    pub fn rounds(&self, task_id: &str) -> Result<Vec<u32>> {
        let dir = self.runs_dir.join(task_key(task_id));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut rounds = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if let Some(round) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                rounds.push(round);
            }
        }
        rounds.sort_unstable();
        Ok(rounds)
    }
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}
