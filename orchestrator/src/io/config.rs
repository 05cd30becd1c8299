//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::{RetryConfig, StageKind};

/// Upper bound on `deadline_secs` (one day).
pub const MAX_DEADLINE_SECS: u64 = 24 * 60 * 60;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Wall-clock window from admission to the deadline, in seconds.
    pub deadline_secs: u64,

    /// Owner used for newly created repositories.
    pub owner: String,

    /// Host suffix of published sites (`https://{owner}.{pages_host}/{repo}/`).
    pub pages_host: String,

    /// Base URL for browsable repository links.
    pub repo_base_url: String,

    pub default_branch: String,

    /// Truncate adapter command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub retry: RetrySettings,
    pub readiness: ReadinessSettings,
    pub adapters: AdapterSettings,
}

/// Retry settings per stage kind. Polling is configured under `readiness`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub generation: RetryConfig,
    pub publish: RetryConfig,
    pub notify: RetryConfig,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            generation: RetryConfig::new(2, Duration::from_secs(1), Duration::from_secs(2)),
            publish: RetryConfig::new(4, Duration::from_secs(2), Duration::from_secs(16)),
            notify: RetryConfig::new(5, Duration::from_secs(1), Duration::from_secs(16)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Upper bound on time spent polling, before the deadline cap applies.
    pub timeout_secs: u64,
    /// Seconds between readiness checks.
    pub interval_secs: u64,
    /// Latency bound of a single check.
    pub check_timeout_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 420,
            interval_secs: 15,
            check_timeout_secs: 10,
        }
    }
}

/// External commands backing the stage adapters.
///
/// A missing command selects the local dry-run adapter for that stage.
/// `{url}` in any argument is replaced with the stage's target URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdapterSettings {
    pub generator: Option<Vec<String>>,
    pub probe: Option<Vec<String>>,
    pub notifier: Option<Vec<String>>,
    /// Downloads an `http(s)` attachment to stdout.
    pub fetcher: Option<Vec<String>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 10 * 60,
            owner: "example".to_string(),
            pages_host: "github.io".to_string(),
            repo_base_url: "https://github.com".to_string(),
            default_branch: "main".to_string(),
            output_limit_bytes: 1_000_000,
            retry: RetrySettings::default(),
            readiness: ReadinessSettings::default(),
            adapters: AdapterSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.deadline_secs == 0 {
            return Err(anyhow!("deadline_secs must be > 0"));
        }
        if self.deadline_secs > MAX_DEADLINE_SECS {
            return Err(anyhow!("deadline_secs must be <= {MAX_DEADLINE_SECS}"));
        }
        if self.owner.trim().is_empty() {
            return Err(anyhow!("owner must be non-empty"));
        }
        if self.pages_host.trim().is_empty() {
            return Err(anyhow!("pages_host must be non-empty"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        self.retry.generation.validate("retry.generation")?;
        self.retry.publish.validate("retry.publish")?;
        self.retry.notify.validate("retry.notify")?;
        if self.readiness.interval_secs == 0 {
            return Err(anyhow!("readiness.interval_secs must be > 0"));
        }
        if self.readiness.check_timeout_secs == 0 {
            return Err(anyhow!("readiness.check_timeout_secs must be > 0"));
        }
        for (name, command) in [
            ("adapters.generator", &self.adapters.generator),
            ("adapters.probe", &self.adapters.probe),
            ("adapters.notifier", &self.adapters.notifier),
            ("adapters.fetcher", &self.adapters.fetcher),
        ] {
            if let Some(command) = command
                && command.first().is_none_or(|program| program.trim().is_empty())
            {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        Ok(())
    }

    pub fn deadline_window(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Retry configuration for a stage kind.
    ///
    /// Polling is sized so attempts cover `min(readiness.timeout, remaining)`.
    pub fn retry_for(&self, kind: StageKind, remaining: Duration) -> RetryConfig {
        match kind {
            StageKind::Generation => self.retry.generation,
            StageKind::Publish => self.retry.publish,
            StageKind::Notify => self.retry.notify,
            StageKind::Poll => {
                let window = Duration::from_secs(self.readiness.timeout_secs).min(remaining);
                RetryConfig::polling(Duration::from_secs(self.readiness.interval_secs), window)
            }
        }
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.check_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
