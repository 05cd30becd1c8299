//! Readiness probes: is the published site reachable yet?

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::naming::parse_pages_url;
use crate::core::types::{ReadinessConfirmation, StageError, StageOutcome};
use crate::io::process::{build_command, run_command};

/// One reachability check of a candidate URL, bounded by `timeout`.
///
/// "Not yet reachable" is a transient failure; the engine polls until success
/// or the polling window closes.
pub trait ReadinessProbe: Send + Sync {
    fn check(
        &self,
        candidate_url: &str,
        timeout: Duration,
    ) -> Result<StageOutcome<ReadinessConfirmation>>;
}

/// Probe that runs a command with `{url}` substituted; exit 0 means reachable.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandProbe {
    pub fn new(argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            output_limit_bytes,
        }
    }
}

impl ReadinessProbe for CommandProbe {
    #[instrument(skip_all, fields(url = candidate_url))]
    fn check(
        &self,
        candidate_url: &str,
        timeout: Duration,
    ) -> Result<StageOutcome<ReadinessConfirmation>> {
        let cmd = build_command(&self.argv, Some(candidate_url))
            .map_err(|err| StageError::terminal(format!("{err:#}")))?;
        let output = run_command(cmd, None, timeout, self.output_limit_bytes)
            .map_err(|err| StageError::terminal(format!("{err:#}")))?;
        if output.succeeded() {
            return Ok(StageOutcome::success(ReadinessConfirmation {
                confirmed_url: candidate_url.to_string(),
            }));
        }
        let reason = if output.timed_out {
            format!("probe timed out after {timeout:?}")
        } else {
            format!(
                "probe exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            )
        };
        debug!(reason = %reason, "site not reachable yet");
        Ok(StageOutcome::failed(StageError::transient(reason)))
    }
}

/// Probe for sites published by [`crate::io::publication::LocalPublisher`]:
/// reachable once `<artifacts>/<owner>/<repo>/index.html` exists.
#[derive(Debug, Clone)]
pub struct LocalProbe {
    artifacts_dir: PathBuf,
    pages_host: String,
}

impl LocalProbe {
    pub fn new(artifacts_dir: impl Into<PathBuf>, pages_host: impl Into<String>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            pages_host: pages_host.into(),
        }
    }
}

impl ReadinessProbe for LocalProbe {
    fn check(
        &self,
        candidate_url: &str,
        _timeout: Duration,
    ) -> Result<StageOutcome<ReadinessConfirmation>> {
        let Some((owner, repo)) = parse_pages_url(candidate_url, &self.pages_host) else {
            return Ok(StageOutcome::failed(StageError::terminal(format!(
                "'{candidate_url}' is not a {} site URL",
                self.pages_host
            ))));
        };
        let index = self.artifacts_dir.join(owner).join(repo).join("index.html");
        if index.is_file() {
            Ok(StageOutcome::success(ReadinessConfirmation {
                confirmed_url: candidate_url.to_string(),
            }))
        } else {
            Ok(StageOutcome::failed(StageError::transient(format!(
                "{} not published yet",
                index.display()
            ))))
        }
    }
}
