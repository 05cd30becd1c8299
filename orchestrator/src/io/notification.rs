//! Notification delivery: hand the sealed payload to the caller's destination.
//!
//! Notifiers send [`SealedPayload::body`] unchanged. They never rebuild the
//! payload, so every retry of a run carries identical bytes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::{SealedPayload, StageError, StageOutcome};
use crate::io::process::{build_command, run_command};

pub trait Notifier: Send + Sync {
    fn notify(&self, destination: &str, payload: &SealedPayload) -> Result<StageOutcome<()>>;
}

/// Notifier that pipes the body into a command with `{url}` set to the
/// destination (for example `curl -fsS -H 'Content-Type: application/json'
/// --data-binary @- {url}`). Exit 0 means delivered.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            timeout,
            output_limit_bytes,
        }
    }
}

impl Notifier for CommandNotifier {
    #[instrument(skip_all, fields(destination = destination))]
    fn notify(&self, destination: &str, payload: &SealedPayload) -> Result<StageOutcome<()>> {
        let cmd = build_command(&self.argv, Some(destination))
            .map_err(|err| StageError::terminal(format!("{err:#}")))?;
        let output = run_command(
            cmd,
            Some(payload.body().as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| StageError::terminal(format!("{err:#}")))?;

        if output.succeeded() {
            info!("notification delivered");
            return Ok(StageOutcome::success(()));
        }
        let reason = if output.timed_out {
            format!("notifier timed out after {:?}", self.timeout)
        } else {
            format!(
                "notifier exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            )
        };
        warn!(reason = %reason, "notification attempt failed");
        Ok(StageOutcome::failed(StageError::transient(reason)))
    }
}

/// Notifier that appends one JSON line per delivery to a local outbox file.
/// Used for dry runs and for callers that collect results out of band.
#[derive(Debug)]
pub struct OutboxNotifier {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, line: &str) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("outbox lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append {}", self.path.display()))
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&self, destination: &str, payload: &SealedPayload) -> Result<StageOutcome<()>> {
        // The body is spliced in as-is so the outbox holds the exact wire bytes.
        let line = format!(
            "{{\"destination\":{},\"payload\":{}}}",
            serde_json::to_string(destination)?,
            payload.body()
        );
        // Outbox write failures are retried.
        if let Err(err) = self.append(&line) {
            return Ok(StageOutcome::failed(StageError::transient(format!("{err:#}"))));
        }
        info!(destination, path = %self.path.display(), "notification written to outbox");
        Ok(StageOutcome::success(()))
    }
}
