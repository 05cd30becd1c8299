//! Test-only helpers: a manual clock, scripted stage adapters and fixtures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;

use crate::core::budget::Clock;
use crate::core::naming::{pages_url, slugify};
use crate::core::types::{
    FileManifest, PublishMode, PublishedRepo, ReadinessConfirmation, RequestPayload,
    RevisionRecord, RunDescriptor, SealedPayload, StageError, StageOutcome,
};
use crate::io::generation::{GenerationRequest, Generator};
use crate::io::notification::Notifier;
use crate::io::publication::{PublishRequest, Publisher};
use crate::io::readiness::ReadinessProbe;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Virtual clock: `sleep` advances time instantly and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ClockState>,
}

#[derive(Debug)]
struct ClockState {
    now: Instant,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                now: Instant::now(),
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, duration: Duration) {
        lock(&self.state).now += duration;
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        lock(&self.state).now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.now += duration;
        state.sleeps.push(duration);
    }
}

/// Queue of outcomes replayed in order, then `fallback` forever.
#[derive(Debug)]
struct Script<T> {
    queued: Mutex<VecDeque<StageOutcome<T>>>,
    fallback: StageOutcome<T>,
    latency: Option<(Arc<ManualClock>, Duration)>,
}

impl<T: Clone> Script<T> {
    fn new(fallback: StageOutcome<T>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback,
            latency: None,
        }
    }

    fn next(&self) -> StageOutcome<T> {
        if let Some((clock, latency)) = &self.latency {
            clock.advance(*latency);
        }
        lock(&self.queued)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn transient<T>(message: &str) -> StageOutcome<T> {
    StageOutcome::failed(StageError::transient(message))
}

/// Generator replaying scripted outcomes; counts calls and keeps the
/// attachment summaries of the latest request.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Script<FileManifest>,
    calls: Mutex<u32>,
    attachment_files: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    /// Always returns `manifest`.
    pub fn succeeding(manifest: FileManifest) -> Self {
        Self::with_fallback(StageOutcome::success(manifest))
    }

    /// Always fails transiently.
    pub fn failing() -> Self {
        Self::with_fallback(transient("generator unavailable"))
    }

    pub fn with_fallback(fallback: StageOutcome<FileManifest>) -> Self {
        Self {
            script: Script::new(fallback),
            calls: Mutex::new(0),
            attachment_files: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, outcome: StageOutcome<FileManifest>) -> Self {
        lock(&self.script.queued).push_back(outcome);
        self
    }

    /// Each call advances `clock` by `latency` before answering.
    pub fn with_latency(mut self, clock: &Arc<ManualClock>, latency: Duration) -> Self {
        self.script.latency = Some((clock.clone(), latency));
        self
    }

    pub fn calls(&self) -> u32 {
        *lock(&self.calls)
    }

    pub fn attachment_files(&self) -> Vec<String> {
        lock(&self.attachment_files).clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<StageOutcome<FileManifest>> {
        *lock(&self.calls) += 1;
        *lock(&self.attachment_files) = request.attachment_files.to_vec();
        Ok(self.script.next())
    }
}

/// One recorded publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    pub mode: PublishMode,
    pub owner_ref: Option<String>,
    pub repo_ref: Option<String>,
    pub manifest: FileManifest,
}

/// Publisher replaying scripted failures; successes echo the requested
/// repository (owner defaults to `octo`) with the manifest digest.
#[derive(Debug)]
pub struct ScriptedPublisher {
    queued: Mutex<VecDeque<StageOutcome<PublishedRepo>>>,
    always_fail: bool,
    latency: Option<(Arc<ManualClock>, Duration)>,
    calls: Mutex<Vec<PublishCall>>,
}

impl ScriptedPublisher {
    pub fn succeeding() -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            always_fail: false,
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails transiently on every call.
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::succeeding()
        }
    }

    pub fn then(self, outcome: StageOutcome<PublishedRepo>) -> Self {
        lock(&self.queued).push_back(outcome);
        self
    }

    pub fn with_latency(mut self, clock: &Arc<ManualClock>, latency: Duration) -> Self {
        self.latency = Some((clock.clone(), latency));
        self
    }

    pub fn calls(&self) -> Vec<PublishCall> {
        lock(&self.calls).clone()
    }
}

impl Publisher for ScriptedPublisher {
    fn publish(&self, request: &PublishRequest<'_>) -> Result<StageOutcome<PublishedRepo>> {
        lock(&self.calls).push(PublishCall {
            mode: request.mode,
            owner_ref: request.owner_ref.map(str::to_string),
            repo_ref: request.repo_ref.map(str::to_string),
            manifest: request.manifest.clone(),
        });
        if let Some((clock, latency)) = &self.latency {
            clock.advance(*latency);
        }
        if let Some(outcome) = lock(&self.queued).pop_front() {
            return Ok(outcome);
        }
        if self.always_fail {
            return Ok(transient("publisher unavailable"));
        }
        Ok(StageOutcome::success(PublishedRepo {
            owner_ref: request.owner_ref.unwrap_or("octo").to_string(),
            repo_ref: request.repo_ref.unwrap_or("site").to_string(),
            commit_ref: request.manifest.digest(),
        }))
    }
}

/// Probe that reports "not yet reachable" for the first `pending` checks.
#[derive(Debug)]
pub struct ScriptedProbe {
    pending: Option<u32>,
    checked: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn ready_after(pending: u32) -> Self {
        Self {
            pending: Some(pending),
            checked: Mutex::new(Vec::new()),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            pending: None,
            checked: Mutex::new(Vec::new()),
        }
    }

    /// URLs checked, in order.
    pub fn checked(&self) -> Vec<String> {
        lock(&self.checked).clone()
    }
}

impl ReadinessProbe for ScriptedProbe {
    fn check(
        &self,
        candidate_url: &str,
        _timeout: Duration,
    ) -> Result<StageOutcome<ReadinessConfirmation>> {
        let mut checked = lock(&self.checked);
        checked.push(candidate_url.to_string());
        match self.pending {
            Some(pending) if checked.len() > pending as usize => {
                Ok(StageOutcome::success(ReadinessConfirmation {
                    confirmed_url: candidate_url.to_string(),
                }))
            }
            _ => Ok(transient("site not reachable yet")),
        }
    }
}

/// Notifier recording every delivered body.
#[derive(Debug)]
pub struct RecordingNotifier {
    script: Script<()>,
    deliveries: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn accepting() -> Self {
        Self::with_fallback(StageOutcome::success(()))
    }

    pub fn rejecting() -> Self {
        Self::with_fallback(transient("destination returned 503"))
    }

    fn with_fallback(fallback: StageOutcome<()>) -> Self {
        Self {
            script: Script::new(fallback),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, outcome: StageOutcome<()>) -> Self {
        lock(&self.script.queued).push_back(outcome);
        self
    }

    pub fn with_latency(mut self, clock: &Arc<ManualClock>, latency: Duration) -> Self {
        self.script.latency = Some((clock.clone(), latency));
        self
    }

    /// `(destination, body)` for every attempt, in order.
    pub fn deliveries(&self) -> Vec<(String, String)> {
        lock(&self.deliveries).clone()
    }

    /// Distinct bodies sent across all attempts.
    pub fn distinct_bodies(&self) -> Vec<String> {
        let mut bodies: Vec<String> = self.deliveries().into_iter().map(|(_, b)| b).collect();
        bodies.sort();
        bodies.dedup();
        bodies
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, destination: &str, payload: &SealedPayload) -> Result<StageOutcome<()>> {
        lock(&self.deliveries).push((destination.to_string(), payload.body().to_string()));
        Ok(self.script.next())
    }
}

/// Descriptor for `task` / `round` whose deadline is `window` from the
/// clock's current instant.
pub fn descriptor(
    task: &str,
    round: u32,
    clock: &Arc<ManualClock>,
    window: Duration,
) -> RunDescriptor {
    let admitted_at = Utc::now();
    let window_delta =
        chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
    RunDescriptor {
        task_id: task.to_string(),
        round,
        nonce: format!("nonce-{}-{round}", slugify(task)),
        email: "student@example.com".to_string(),
        evaluation_url: "https://eval.test/notify".to_string(),
        admitted_at,
        deadline_at: admitted_at + window_delta,
        deadline: clock.now() + window,
        request: RequestPayload {
            brief: format!("Build a page for {task}"),
            checks: vec!["Page has a heading".to_string()],
            attachments: Vec::new(),
        },
    }
}

/// Record of a previously published round, owned by `octo`.
pub fn revision(task: &str, round: u32) -> RevisionRecord {
    let repo = format!("{}-r1-abc123", slugify(task));
    RevisionRecord {
        task_id: task.to_string(),
        owner_ref: "octo".to_string(),
        published_url: pages_url("octo", &repo, "github.io"),
        repo_ref: repo,
        last_commit_ref: "c0ffee".to_string(),
        last_round: round,
        default_branch: Some("main".to_string()),
        updated_at: None,
    }
}

pub fn sample_manifest() -> FileManifest {
    let mut manifest = FileManifest::new();
    manifest.insert("index.html", "<!doctype html><h1>Generated</h1>");
    manifest.insert("app.js", "console.log('ready')");
    manifest
}
