//! Generation adapter contract and the command-backed implementation.
//!
//! The [`Generator`] trait decouples the engine from how site content is
//! produced. Tests use scripted generators; production shells out to a
//! configured command that prints a file manifest as JSON.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{FileManifest, RequestPayload, RevisionRecord, StageError, StageOutcome};
use crate::io::process::{build_command, run_command};

/// Parameters for one generation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest<'a> {
    pub task_id: &'a str,
    pub round: u32,
    pub request: &'a RequestPayload,
    /// Prior round's published state, when this task has one.
    pub revision: Option<&'a RevisionRecord>,
    /// Attachments already placed in the site, as `"<path> (<size> bytes)"`.
    pub attachment_files: &'a [String],
    #[serde(skip)]
    pub timeout: Duration,
}

/// Produces site content for a request. Must be safe to call again after a
/// failure; every call returns an equally valid manifest.
pub trait Generator: Send + Sync {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<StageOutcome<FileManifest>>;
}

/// Generator that pipes the request as JSON into a command and parses the
/// manifest (`{"path": "contents", ...}`) from its stdout. Binary files are
/// given as `{"path": {"base64": "..."}}`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            output_limit_bytes,
        }
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(task_id = request.task_id, round = request.round))]
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<StageOutcome<FileManifest>> {
        let input = serde_json::to_vec(request)?;
        let cmd = build_command(&self.argv, None)
            .map_err(|err| StageError::terminal(format!("{err:#}")))?;
        info!(program = %self.argv[0], "running generator");
        let output = run_command(cmd, Some(&input), request.timeout, self.output_limit_bytes)
            .map_err(|err| StageError::terminal(format!("{err:#}")))?;

        if output.timed_out {
            return Ok(StageOutcome::failed(StageError::transient(format!(
                "generator timed out after {:?}",
                request.timeout
            ))));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Ok(StageOutcome::failed(StageError::transient(format!(
                "generator exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            ))));
        }

        let manifest: FileManifest = match serde_json::from_slice(&output.stdout) {
            Ok(manifest) => manifest,
            Err(err) => {
                return Ok(StageOutcome::failed(StageError::terminal(format!(
                    "generator output is not a file manifest: {err}"
                ))));
            }
        };
        if manifest.is_empty() {
            return Ok(StageOutcome::failed(StageError::terminal(
                "generator returned an empty manifest",
            )));
        }
        debug!(files = manifest.len(), "generator produced manifest");
        Ok(StageOutcome::success(manifest))
    }
}

/// Stand-in used when no generator command is configured: every call fails
/// terminally so the engine goes straight to the deterministic fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGenerator;

impl Generator for UnconfiguredGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<StageOutcome<FileManifest>> {
        warn!(task_id = request.task_id, "no generator configured");
        Ok(StageOutcome::failed(StageError::terminal(
            "no generator command configured",
        )))
    }
}
