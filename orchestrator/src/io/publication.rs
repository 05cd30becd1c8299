//! Publication adapter contract and the local filesystem publisher.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::{FileManifest, PublishMode, PublishedRepo, StageError, StageOutcome};

/// Parameters for one publication attempt.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub mode: PublishMode,
    /// Existing owner in update mode; `None` lets the adapter pick one.
    pub owner_ref: Option<&'a str>,
    /// Existing repository in update mode, proposed name in create mode.
    pub repo_ref: Option<&'a str>,
    pub manifest: &'a FileManifest,
}

/// Creates or updates the repository holding a site.
///
/// Create mode must be retry-safe: a retried create for the same proposed
/// name must resolve to the same repository, never a duplicate.
pub trait Publisher: Send + Sync {
    fn publish(&self, request: &PublishRequest<'_>) -> Result<StageOutcome<PublishedRepo>>;
}

/// Publisher that materializes repositories under a local artifacts directory
/// (`<artifacts>/<owner>/<repo>/`). Used for dry runs.
#[derive(Debug, Clone)]
pub struct LocalPublisher {
    artifacts_dir: PathBuf,
    default_owner: String,
}

impl LocalPublisher {
    pub fn new(artifacts_dir: impl Into<PathBuf>, default_owner: impl Into<String>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            default_owner: default_owner.into(),
        }
    }

    pub fn repo_dir(&self, owner: &str, repo: &str) -> PathBuf {
        self.artifacts_dir.join(owner).join(repo)
    }
}

impl Publisher for LocalPublisher {
    #[instrument(skip_all, fields(mode = ?request.mode))]
    fn publish(&self, request: &PublishRequest<'_>) -> Result<StageOutcome<PublishedRepo>> {
        let owner = request.owner_ref.unwrap_or(&self.default_owner);
        let Some(repo) = request.repo_ref else {
            return Ok(StageOutcome::failed(StageError::terminal(
                "publication requires a repository name",
            )));
        };
        for (label, name) in [("owner", owner), ("repository", repo)] {
            if !is_plain_name(name) {
                return Ok(StageOutcome::failed(StageError::terminal(format!(
                    "invalid {label} name '{name}'"
                ))));
            }
        }
        if let Some(path) = request.manifest.paths().find(|p| !is_safe_relative(p)) {
            return Ok(StageOutcome::failed(StageError::terminal(format!(
                "manifest path escapes the repository: {path}"
            ))));
        }

        let dir = self.repo_dir(owner, repo);
        match (request.mode, dir.exists()) {
            (PublishMode::Create, true) => {
                info!(dir = %dir.display(), "repository already exists, reusing it");
            }
            (PublishMode::Update, false) => {
                warn!(dir = %dir.display(), "repository missing for update, recreating it");
            }
            _ => {}
        }
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("clear {}", dir.display()))?;
        }
        write_manifest(&dir, request.manifest)?;

        let commit_ref = request.manifest.digest();
        info!(owner, repo, commit_ref = %commit_ref, files = request.manifest.len(), "published");
        Ok(StageOutcome::success(PublishedRepo {
            owner_ref: owner.to_string(),
            repo_ref: repo.to_string(),
            commit_ref,
        }))
    }
}

fn write_manifest(dir: &Path, manifest: &FileManifest) -> Result<()> {
    for (path, contents) in manifest.iter() {
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&target, contents.as_bytes()).with_context(|| format!("write {}", target.display()))?;
    }
    Ok(())
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageErrorKind;

    fn manifest(index: &str) -> FileManifest {
        let mut manifest = FileManifest::new();
        manifest.insert("index.html", index);
        manifest.insert("assets/app.js", "console.log(1)");
        manifest
    }

    fn request<'a>(
        mode: PublishMode,
        repo: &'a str,
        manifest: &'a FileManifest,
    ) -> PublishRequest<'a> {
        PublishRequest {
            mode,
            owner_ref: None,
            repo_ref: Some(repo),
            manifest,
        }
    }

    #[test]
    fn create_writes_files_under_owner_and_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let publisher = LocalPublisher::new(temp.path(), "octo");
        let files = manifest("<p>v1</p>");

        let outcome = publisher
            .publish(&request(PublishMode::Create, "site-r1-abc", &files))
            .expect("publish");
        let repo = outcome.into_value().expect("published");

        assert_eq!(repo.owner_ref, "octo");
        assert_eq!(repo.repo_ref, "site-r1-abc");
        assert_eq!(repo.commit_ref, files.digest());
        let dir = publisher.repo_dir("octo", "site-r1-abc");
        assert_eq!(
            fs::read_to_string(dir.join("index.html")).expect("index"),
            "<p>v1</p>"
        );
        assert!(dir.join("assets/app.js").is_file());
    }

    #[test]
    fn retried_create_reuses_the_same_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let publisher = LocalPublisher::new(temp.path(), "octo");
        let files = manifest("<p>v1</p>");

        let first = publisher
            .publish(&request(PublishMode::Create, "site", &files))
            .expect("first");
        let second = publisher
            .publish(&request(PublishMode::Create, "site", &files))
            .expect("second");

        assert_eq!(first, second);
        let repos = fs::read_dir(temp.path().join("octo")).expect("owner dir").count();
        assert_eq!(repos, 1);
    }

    #[test]
    fn update_replaces_previous_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let publisher = LocalPublisher::new(temp.path(), "octo");
        publisher
            .publish(&request(PublishMode::Create, "site", &manifest("<p>v1</p>")))
            .expect("create");

        let mut next = FileManifest::new();
        next.insert("index.html", "<p>v2</p>");
        let update = PublishRequest {
            owner_ref: Some("octo"),
            ..request(PublishMode::Update, "site", &next)
        };
        publisher.publish(&update).expect("update");

        let dir = publisher.repo_dir("octo", "site");
        assert_eq!(
            fs::read_to_string(dir.join("index.html")).expect("index"),
            "<p>v2</p>"
        );
        assert!(!dir.join("assets/app.js").exists());
    }

    #[test]
    fn rejects_escaping_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let publisher = LocalPublisher::new(temp.path(), "octo");
        let mut files = FileManifest::new();
        files.insert("../outside.txt", "x");

        let outcome = publisher
            .publish(&request(PublishMode::Create, "site", &files))
            .expect("publish");
        assert_eq!(
            outcome.failure().map(|f| f.kind),
            Some(StageErrorKind::Terminal)
        );
        assert!(!temp.path().join("outside.txt").exists());
    }
}
