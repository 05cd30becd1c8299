//! Shared deterministic types for the orchestration core.
//!
//! These types define the stable contracts between the engine and the stage
//! adapters. They hold no I/O handles and serialize to stable JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Retry classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Retryable: network blips, rate limits, timeouts of a single attempt.
    Transient,
    /// Not retryable: invalid manifest, auth failure, missing configuration.
    Terminal,
    /// The run's deadline budget is exhausted.
    DeadlineExceeded,
}

/// Classified failure reported by a stage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::DeadlineExceeded,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == StageErrorKind::Transient
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            StageErrorKind::Transient => "transient",
            StageErrorKind::Terminal => "terminal",
            StageErrorKind::DeadlineExceeded => "deadline exceeded",
        };
        write!(f, "{kind}: {}", self.message)
    }
}

impl std::error::Error for StageError {}

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome<T> {
    Success { value: T },
    /// Usable but incomplete, e.g. published but readiness never confirmed.
    Degraded { value: T, reason: String },
    Failed { reason: StageError },
}

impl<T> StageOutcome<T> {
    pub fn success(value: T) -> Self {
        Self::Success { value }
    }

    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Self::Degraded {
            value,
            reason: reason.into(),
        }
    }

    pub fn failed(reason: StageError) -> Self {
        Self::Failed { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Success { value } | Self::Degraded { value, .. } => Some(value),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&StageError> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Degraded { .. } => "degraded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Final status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Published and confirmed reachable.
    Ready,
    /// Published, reachability not confirmed before the deadline.
    Pending,
    /// Generation fell back to the template, or publication failed.
    Fallback,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Pending => "pending",
            Self::Fallback => "fallback",
        }
    }
}

/// File attached to a request, referenced by data URI or absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

/// Opaque brief handed to the generation adapter untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub brief: String,
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Identity of one orchestration attempt. Immutable after admission.
#[derive(Debug, Clone, Serialize)]
pub struct RunDescriptor {
    pub task_id: String,
    pub round: u32,
    /// Correlation token echoed back verbatim.
    pub nonce: String,
    pub email: String,
    /// Caller-supplied notification destination.
    pub evaluation_url: String,
    pub admitted_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    #[serde(skip)]
    pub deadline: Instant,
    pub request: RequestPayload,
}

/// Durable per-task state enabling round-over-round reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub task_id: String,
    pub owner_ref: String,
    pub repo_ref: String,
    pub last_commit_ref: String,
    pub published_url: String,
    pub last_round: u32,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Contents of one manifest file.
///
/// Text serializes as a plain JSON string; binary contents as
/// `{"base64": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContents {
    Text(String),
    Binary {
        #[serde(with = "base64_bytes")]
        base64: Vec<u8>,
    },
}

impl FileContents {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary { base64 } => base64,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary { .. } => None,
        }
    }
}

impl From<String> for FileContents {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for FileContents {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for FileContents {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary { base64: bytes }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Generated site content: relative path to file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileManifest {
    files: BTreeMap<String, FileContents>,
}

impl FileManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `path`.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<FileContents>) {
        self.files.insert(path.into(), contents.into());
    }

    /// Insert only when `path` is absent. Returns true if inserted.
    pub fn insert_missing(&mut self, path: &str, contents: impl Into<FileContents>) -> bool {
        if self.files.contains_key(path) {
            return false;
        }
        self.files.insert(path.to_string(), contents.into());
        true
    }

    /// Text contents of `path`; `None` when absent or binary.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).and_then(FileContents::as_text)
    }

    pub fn get_bytes(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(FileContents::as_bytes)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileContents)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Content hash over sorted paths and contents (hex SHA-256).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, contents) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(contents.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Whether publication creates a new repository or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Create,
    Update,
}

/// Repository coordinates returned by a successful publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRepo {
    pub owner_ref: String,
    pub repo_ref: String,
    pub commit_ref: String,
}

/// URL confirmed reachable by the readiness adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessConfirmation {
    pub confirmed_url: String,
}

/// The single outbound result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub email: String,
    pub task: String,
    pub round: u32,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_url: Option<String>,
    pub status: RunStatus,
}

/// A payload frozen together with its wire body.
///
/// Every delivery attempt sends `body()` byte for byte; the payload cannot be
/// mutated once sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    payload: NotificationPayload,
    body: String,
}

impl SealedPayload {
    pub fn seal(payload: NotificationPayload) -> Result<Self> {
        let body = serde_json::to_string(&payload).context("serialize notification payload")?;
        Ok(Self { payload, body })
    }

    /// Rebuild from a previously sealed body, keeping the bytes unchanged.
    pub fn from_body(body: String) -> Result<Self> {
        let payload: NotificationPayload =
            serde_json::from_str(&body).context("parse notification payload")?;
        Ok(Self { payload, body })
    }

    pub fn payload(&self) -> &NotificationPayload {
        &self.payload
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(status: RunStatus) -> NotificationPayload {
        NotificationPayload {
            email: "dev@example.com".to_string(),
            task: "task-1".to_string(),
            round: 2,
            nonce: "n-1".to_string(),
            repo_url: None,
            commit_sha: None,
            pages_url: Some("https://example.github.io/task-1/".to_string()),
            status,
        }
    }

    #[test]
    fn payload_omits_absent_fields() {
        let sealed = SealedPayload::seal(payload(RunStatus::Pending)).expect("seal");
        assert!(!sealed.body().contains("repo_url"));
        assert!(!sealed.body().contains("commit_sha"));
        assert!(sealed.body().contains("\"status\":\"pending\""));
    }

    #[test]
    fn from_body_keeps_bytes() {
        let body = r#"{"email":"a@b.c","task":"t","round":1,"nonce":"x","status":"fallback"}"#;
        let sealed = SealedPayload::from_body(body.to_string()).expect("parse");
        assert_eq!(sealed.body(), body);
        assert_eq!(sealed.payload().status, RunStatus::Fallback);
    }

    #[test]
    fn manifest_digest_depends_on_content() {
        let mut a = FileManifest::new();
        a.insert("index.html", "<h1>a</h1>");
        let mut b = a.clone();
        assert_eq!(a.digest(), b.digest());

        b.insert("index.html", "<h1>b</h1>");
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn insert_missing_keeps_existing() {
        let mut manifest = FileManifest::new();
        manifest.insert("README.md", "custom");
        assert!(!manifest.insert_missing("README.md", "default"));
        assert!(manifest.insert_missing("LICENSE", "mit"));
        assert_eq!(manifest.get("README.md"), Some("custom"));
    }

    #[test]
    fn binary_contents_travel_as_base64() {
        let json = r#"{"assets/logo.png":{"base64":"iVBORw0KGgo="},"index.html":"<p>hi</p>"}"#;
        let manifest: FileManifest = serde_json::from_str(json).expect("parse");
        assert_eq!(manifest.get("index.html"), Some("<p>hi</p>"));
        assert_eq!(manifest.get("assets/logo.png"), None);
        assert_eq!(
            manifest.get_bytes("assets/logo.png"),
            Some(&b"\x89PNG\r\n\x1a\n"[..])
        );
        assert_eq!(serde_json::to_string(&manifest).expect("serialize"), json);

        let bad = r#"{"a.bin":{"base64":"not base64!"}}"#;
        assert!(serde_json::from_str::<FileManifest>(bad).is_err());
    }

    #[test]
    fn failed_outcome_has_no_value() {
        let outcome: StageOutcome<u32> = StageOutcome::failed(StageError::terminal("bad"));
        assert_eq!(outcome.label(), "failed");
        assert!(!outcome.failure().expect("failure").is_retryable());
        assert!(outcome.into_value().is_none());
    }
}
