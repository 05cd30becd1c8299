//! Orchestration engine: one run from admission to its single notification.
//!
//! A run moves through
//! `Admitted → Resolving → Generating → Publishing → AwaitingReadiness →
//! Notifying → Completed | CompletedDegraded`. Every stage is wrapped in a
//! [`RetryPolicy`] bounded by the run's [`DeadlineBudget`]. Stage failures
//! degrade the reported status but never stop the run short of notifying.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::{Clock, DeadlineBudget};
use crate::core::naming::{pages_url, random_suffix, repo_name, repo_url};
use crate::core::retry::{RetryPolicy, StageKind};
use crate::core::types::{
    FileManifest, NotificationPayload, PublishMode, PublishedRepo, RevisionRecord, RunDescriptor,
    RunStatus, SealedPayload, StageOutcome,
};
use crate::io::attachments::{AttachmentFile, materialize};
use crate::io::config::OrchestratorConfig;
use crate::io::generation::GenerationRequest;
use crate::io::journal::RunJournal;
use crate::io::publication::PublishRequest;
use crate::io::revision_store::RevisionStore;
use crate::io::site::{SiteContext, complete_manifest, fallback_manifest};
use crate::stages::Stages;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Admitted,
    Resolving,
    Generating,
    Publishing,
    AwaitingReadiness,
    Notifying,
    Completed,
    CompletedDegraded,
}

/// How the run relates to prior rounds of the same task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RunMode {
    /// No prior record: a new repository is created.
    Create,
    /// Prior record found: its repository is updated. `stale` is set when the
    /// record is from this round or a later one.
    Reuse { stale: bool },
    /// A payload was already sealed for this round by an interrupted run; it
    /// is re-delivered without running any stage.
    Resumed,
}

/// Attempts made per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageAttempts {
    pub generation: u32,
    pub publish: u32,
    pub poll: u32,
    pub notify: u32,
}

/// Summary of a finished run, journaled as `report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub task_id: String,
    pub round: u32,
    pub phases: Vec<RunPhase>,
    #[serde(flatten)]
    pub mode: RunMode,
    pub status: RunStatus,
    pub payload: NotificationPayload,
    pub delivered: bool,
    pub attempts: StageAttempts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub revision_saved: bool,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn terminal_phase(&self) -> RunPhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(RunPhase::CompletedDegraded)
    }

    pub fn is_degraded(&self) -> bool {
        self.terminal_phase() != RunPhase::Completed
    }
}

/// Drives runs against a revision store and a set of stage adapters.
///
/// Shared by concurrent runs of different tasks; holds no per-run state.
pub struct Engine {
    config: OrchestratorConfig,
    store: Arc<dyn RevisionStore>,
    stages: Stages,
    clock: Arc<dyn Clock>,
    journal: Option<RunJournal>,
}

impl Engine {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn RevisionStore>,
        stages: Stages,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            stages,
            clock,
            journal: None,
        }
    }

    /// Journal descriptor, payload and report of every run under `journal`.
    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Execute one run to a terminal state. Never fails: stage errors are
    /// folded into the reported status, and exactly one payload is built and
    /// handed to the notifier.
    ///
    /// When the journal already holds a payload for this task, round and
    /// nonce, that payload is re-delivered instead of running the stages
    /// again.
    #[instrument(skip_all, fields(task_id = %descriptor.task_id, round = descriptor.round))]
    pub fn run(&self, descriptor: &RunDescriptor) -> RunReport {
        let budget = DeadlineBudget::until(self.clock.clone(), descriptor.deadline);
        let mut run = RunState::new();
        info!(remaining_ms = budget.remaining().as_millis() as u64, "run admitted");
        if let Some(sealed) = self.sealed_earlier(descriptor) {
            info!("payload already sealed for this round, re-delivering it");
            run.enter(RunPhase::Notifying);
            let delivered = self.deliver(descriptor, &sealed, &budget, &mut run);
            let payload = sealed.payload().clone();
            return self.finish(descriptor, run, RunMode::Resumed, payload, delivered, &budget);
        }
        if let Some(journal) = &self.journal
            && let Err(err) = journal.write_descriptor(descriptor)
        {
            warn!(err = %format!("{err:#}"), "could not journal descriptor");
        }

        run.enter(RunPhase::Resolving);
        let prior = self.resolve(descriptor);
        let mode = match &prior {
            None => RunMode::Create,
            Some(record) => RunMode::Reuse {
                stale: record.last_round >= descriptor.round,
            },
        };
        let target = Target::for_run(&self.config, descriptor, prior.as_ref());
        info!(mode = ?mode, repo = %target.repo, "resolved run mode");

        run.enter(RunPhase::Generating);
        let manifest = self.generate(descriptor, prior.as_ref(), &target, &budget, &mut run);

        run.enter(RunPhase::Publishing);
        let published = self.publish(&target, &manifest, &budget, &mut run);
        if let Some(repo) = &published {
            run.revision_saved = self.save_revision(descriptor, prior.as_ref(), repo);
        }

        run.enter(RunPhase::AwaitingReadiness);
        let confirmed_url = match &published {
            Some(repo) => self.await_readiness(repo, &budget, &mut run),
            None => None,
        };

        run.enter(RunPhase::Notifying);
        let status = if run.fallback_reason.is_some() {
            RunStatus::Fallback
        } else if confirmed_url.is_some() {
            RunStatus::Ready
        } else {
            RunStatus::Pending
        };
        let payload = self.build_payload(descriptor, published.as_ref(), confirmed_url, status);
        let delivered = self.notify(descriptor, &payload, &budget, &mut run);
        self.finish(descriptor, run, mode, payload, delivered, &budget)
    }

    /// Enter the terminal phase and journal the report.
    fn finish(
        &self,
        descriptor: &RunDescriptor,
        mut run: RunState,
        mode: RunMode,
        payload: NotificationPayload,
        delivered: bool,
        budget: &DeadlineBudget,
    ) -> RunReport {
        let status = payload.status;
        let terminal = if status == RunStatus::Ready && delivered {
            RunPhase::Completed
        } else {
            RunPhase::CompletedDegraded
        };
        run.enter(terminal);

        let report = RunReport {
            task_id: descriptor.task_id.clone(),
            round: descriptor.round,
            phases: run.phases,
            mode,
            status,
            payload,
            delivered,
            attempts: run.attempts,
            fallback_reason: run.fallback_reason,
            revision_saved: run.revision_saved,
            duration_ms: budget.elapsed().as_millis() as u64,
        };
        if let Some(journal) = &self.journal
            && let Err(err) = journal.write_report(&descriptor.task_id, descriptor.round, &report)
        {
            warn!(err = %format!("{err:#}"), "could not journal run report");
        }
        info!(
            status = status.as_str(),
            delivered,
            terminal = ?terminal,
            duration_ms = report.duration_ms,
            "run finished"
        );
        report
    }

    /// Payload journaled by an earlier attempt at this exact run. A payload
    /// sealed under another nonce belongs to a different request and is
    /// ignored.
    fn sealed_earlier(&self, descriptor: &RunDescriptor) -> Option<SealedPayload> {
        let journal = self.journal.as_ref()?;
        match journal.stored_payload(&descriptor.task_id, descriptor.round) {
            Ok(Some(sealed)) if sealed.payload().nonce == descriptor.nonce => Some(sealed),
            Ok(Some(_)) => {
                warn!("journaled payload has a different nonce, running the stages again");
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "unreadable journaled payload, running the stages again");
                None
            }
        }
    }

    /// Load the prior record. A store failure is treated as "no record".
    fn resolve(&self, descriptor: &RunDescriptor) -> Option<RevisionRecord> {
        match self.store.load(&descriptor.task_id) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    err = %format!("{err:#}"),
                    "revision lookup failed, creating a new repository"
                );
                None
            }
        }
    }

    fn generate(
        &self,
        descriptor: &RunDescriptor,
        prior: Option<&RevisionRecord>,
        target: &Target,
        budget: &DeadlineBudget,
        run: &mut RunState,
    ) -> FileManifest {
        let attachments = materialize(
            &descriptor.request.attachments,
            self.stages.fetcher.as_ref(),
            budget,
        );
        let summaries: Vec<String> = attachments.iter().map(AttachmentFile::summary).collect();

        let policy = self.policy(StageKind::Generation, budget);
        let attempted = policy.run(budget, |_| {
            let request = GenerationRequest {
                task_id: &descriptor.task_id,
                round: descriptor.round,
                request: &descriptor.request,
                revision: prior,
                attachment_files: &summaries,
                timeout: budget.remaining(),
            };
            self.stages.generator.generate(&request)
        });
        run.attempts.generation = attempted.attempts;

        let site = SiteContext {
            descriptor,
            owner: &target.owner,
            pages_url: &target.pages_url,
            branch: &self.config.default_branch,
            attachments: &attachments,
        };
        match attempted.outcome {
            StageOutcome::Success { value } => complete_manifest(value, &site),
            StageOutcome::Degraded { value, reason } => {
                warn!(reason = %reason, "generation degraded");
                complete_manifest(value, &site)
            }
            StageOutcome::Failed { reason } => {
                warn!(reason = %reason, "generation failed, using fallback site");
                run.fall_back(format!("generation: {reason}"));
                fallback_manifest(&site)
            }
        }
    }

    fn publish(
        &self,
        target: &Target,
        manifest: &FileManifest,
        budget: &DeadlineBudget,
        run: &mut RunState,
    ) -> Option<PublishedRepo> {
        let request = PublishRequest {
            mode: target.mode,
            owner_ref: target.owner_ref.as_deref(),
            repo_ref: Some(&target.repo),
            manifest,
        };
        let policy = self.policy(StageKind::Publish, budget);
        let attempted = policy.run(budget, |_| self.stages.publisher.publish(&request));
        run.attempts.publish = attempted.attempts;
        match attempted.outcome {
            StageOutcome::Success { value } | StageOutcome::Degraded { value, .. } => Some(value),
            StageOutcome::Failed { reason } => {
                error!(reason = %reason, attempts = attempted.attempts, "publication failed");
                run.fall_back(format!("publication: {reason}"));
                None
            }
        }
    }

    /// Save the new record unless a later round is already stored. Returns
    /// whether the record was written.
    fn save_revision(
        &self,
        descriptor: &RunDescriptor,
        prior: Option<&RevisionRecord>,
        repo: &PublishedRepo,
    ) -> bool {
        if let Some(prior) = prior
            && prior.last_round > descriptor.round
        {
            warn!(
                stored_round = prior.last_round,
                "stored revision is from a later round, not overwriting"
            );
            return false;
        }
        let record = RevisionRecord {
            task_id: descriptor.task_id.clone(),
            owner_ref: repo.owner_ref.clone(),
            repo_ref: repo.repo_ref.clone(),
            last_commit_ref: repo.commit_ref.clone(),
            published_url: self.pages_url_for(repo),
            last_round: descriptor.round,
            default_branch: Some(self.config.default_branch.clone()),
            updated_at: Some(Utc::now().to_rfc3339()),
        };
        match self.store.save(&descriptor.task_id, &record) {
            Ok(()) => true,
            Err(err) => {
                error!(err = %format!("{err:#}"), "could not save revision record");
                false
            }
        }
    }

    fn await_readiness(
        &self,
        repo: &PublishedRepo,
        budget: &DeadlineBudget,
        run: &mut RunState,
    ) -> Option<String> {
        let candidate = self.pages_url_for(repo);
        let policy = self.policy(StageKind::Poll, budget);
        let check_timeout = self.config.check_timeout();
        let attempted = policy.run(budget, |_| {
            let timeout = check_timeout.min(budget.remaining());
            self.stages.probe.check(&candidate, timeout)
        });
        run.attempts.poll = attempted.attempts;
        match attempted.outcome {
            StageOutcome::Success { value } => Some(value.confirmed_url),
            other => {
                info!(
                    outcome = other.label(),
                    polls = attempted.attempts,
                    "site not confirmed before the polling window closed"
                );
                None
            }
        }
    }

    fn build_payload(
        &self,
        descriptor: &RunDescriptor,
        published: Option<&PublishedRepo>,
        confirmed_url: Option<String>,
        status: RunStatus,
    ) -> NotificationPayload {
        NotificationPayload {
            email: descriptor.email.clone(),
            task: descriptor.task_id.clone(),
            round: descriptor.round,
            nonce: descriptor.nonce.clone(),
            repo_url: published
                .map(|repo| repo_url(&self.config.repo_base_url, &repo.owner_ref, &repo.repo_ref)),
            commit_sha: published.map(|repo| repo.commit_ref.clone()),
            pages_url: confirmed_url.or_else(|| published.map(|repo| self.pages_url_for(repo))),
            status,
        }
    }

    /// Seal the payload once and deliver it. The first attempt is made even
    /// when the deadline has passed; retries stop at the deadline.
    fn notify(
        &self,
        descriptor: &RunDescriptor,
        payload: &NotificationPayload,
        budget: &DeadlineBudget,
        run: &mut RunState,
    ) -> bool {
        let sealed = match SealedPayload::seal(payload.clone()) {
            Ok(sealed) => sealed,
            Err(err) => {
                error!(err = %format!("{err:#}"), "could not seal notification payload");
                return false;
            }
        };
        if let Some(journal) = &self.journal
            && let Err(err) = journal.write_payload(&descriptor.task_id, descriptor.round, &sealed)
        {
            warn!(err = %format!("{err:#}"), "could not journal payload");
        }
        self.deliver(descriptor, &sealed, budget, run)
    }

    fn deliver(
        &self,
        descriptor: &RunDescriptor,
        sealed: &SealedPayload,
        budget: &DeadlineBudget,
        run: &mut RunState,
    ) -> bool {
        let policy = self.policy(StageKind::Notify, budget);
        let attempted = policy.run_at_least_once(budget, |_| {
            self.stages
                .notifier
                .notify(&descriptor.evaluation_url, sealed)
        });
        run.attempts.notify = attempted.attempts;
        match attempted.outcome {
            StageOutcome::Success { .. } | StageOutcome::Degraded { .. } => true,
            StageOutcome::Failed { reason } => {
                error!(reason = %reason, attempts = attempted.attempts, "notification not delivered");
                false
            }
        }
    }

    fn policy(&self, kind: StageKind, budget: &DeadlineBudget) -> RetryPolicy {
        RetryPolicy::new(kind, self.config.retry_for(kind, budget.remaining()))
    }

    fn pages_url_for(&self, repo: &PublishedRepo) -> String {
        pages_url(&repo.owner_ref, &repo.repo_ref, &self.config.pages_host)
    }
}

/// Repository a run publishes to, fixed once per run so that publish retries
/// never propose a second name.
#[derive(Debug)]
struct Target {
    mode: PublishMode,
    /// `None` lets the publisher choose the owner of a new repository.
    owner_ref: Option<String>,
    /// Expected owner, for templates rendered before publication.
    owner: String,
    repo: String,
    pages_url: String,
}

impl Target {
    fn for_run(
        config: &OrchestratorConfig,
        descriptor: &RunDescriptor,
        prior: Option<&RevisionRecord>,
    ) -> Self {
        let (mode, owner_ref, owner, repo) = match prior {
            Some(record) => (
                PublishMode::Update,
                Some(record.owner_ref.clone()),
                record.owner_ref.clone(),
                record.repo_ref.clone(),
            ),
            None => (
                PublishMode::Create,
                None,
                config.owner.clone(),
                repo_name(&descriptor.task_id, descriptor.round, &random_suffix()),
            ),
        };
        let pages_url = pages_url(&owner, &repo, &config.pages_host);
        Self {
            mode,
            owner_ref,
            owner,
            repo,
            pages_url,
        }
    }
}

/// Mutable bookkeeping for the run in progress.
#[derive(Debug)]
struct RunState {
    phases: Vec<RunPhase>,
    attempts: StageAttempts,
    fallback_reason: Option<String>,
    revision_saved: bool,
}

impl RunState {
    fn new() -> Self {
        Self {
            phases: vec![RunPhase::Admitted],
            attempts: StageAttempts::default(),
            fallback_reason: None,
            revision_saved: false,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(phase = ?phase, "entering phase");
        self.phases.push(phase);
    }

    /// Record why the run fell back; the first cause wins.
    fn fall_back(&mut self, reason: String) {
        self.fallback_reason.get_or_insert(reason);
    }
}
