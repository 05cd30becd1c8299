//! Workspace layout and scaffolding for `.orchestrator/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{OrchestratorConfig, write_config};

const WORKSPACE_GITIGNORE: &str = "artifacts/\nruns/\nqueue/\noutbox.jsonl\n";

/// All canonical paths within `.orchestrator/` for a workspace root.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub revisions_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub outbox_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            revisions_dir: state_dir.join("revisions"),
            runs_dir: state_dir.join("runs"),
            queue_dir: state_dir.join("queue"),
            artifacts_dir: state_dir.join("artifacts"),
            outbox_path: state_dir.join("outbox.jsonl"),
        }
    }
}

/// Create `.orchestrator/` scaffolding in `root`.
///
/// Fails if `.orchestrator/` already exists unless `force` is set; `force`
/// rewrites the config but never deletes revisions, journals or queued work.
pub fn init_workspace(root: &Path, force: bool) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if paths.state_dir.exists() && !force {
        return Err(anyhow!(
            "init: .orchestrator already exists (use --force to overwrite)"
        ));
    }
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("init: .orchestrator exists but is not a directory"));
    }

    for dir in [
        &paths.state_dir,
        &paths.revisions_dir,
        &paths.runs_dir,
        &paths.queue_dir,
        &paths.artifacts_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, WORKSPACE_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &OrchestratorConfig::default())?;

    info!(root = %root.display(), "initialized orchestrator workspace");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), false).expect("init");

        assert!(paths.revisions_dir.is_dir());
        assert!(paths.runs_dir.is_dir());
        assert!(paths.queue_dir.is_dir());
        assert!(paths.artifacts_dir.is_dir());
        let ignore = fs::read_to_string(&paths.gitignore_path).expect("gitignore");
        assert!(ignore.lines().any(|l| l == "runs/"));
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            OrchestratorConfig::default()
        );
    }

    #[test]
    fn init_refuses_existing_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), false).expect("first init");

        let err = init_workspace(temp.path(), false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init_workspace(temp.path(), true).expect("forced init");
    }
}
