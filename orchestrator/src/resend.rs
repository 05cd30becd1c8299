//! Re-deliver a journaled notification.
//!
//! The journaled `payload.json` is sent byte for byte; the payload is never
//! rebuilt. Delivery runs through the notify retry policy with a fresh budget.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::budget::{Clock, DeadlineBudget};
use crate::core::retry::{RetryPolicy, StageKind};
use crate::io::config::OrchestratorConfig;
use crate::io::journal::RunJournal;
use crate::io::notification::Notifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendOutcome {
    pub destination: String,
    pub delivered: bool,
    pub attempts: u32,
}

pub fn resend(
    journal: &RunJournal,
    notifier: &dyn Notifier,
    config: &OrchestratorConfig,
    clock: Arc<dyn Clock>,
    task_id: &str,
    round: u32,
) -> Result<ResendOutcome> {
    let descriptor = journal
        .read_descriptor(task_id, round)
        .with_context(|| format!("no journaled run for task '{task_id}' round {round}"))?;
    let payload = journal
        .read_payload(task_id, round)
        .with_context(|| format!("no journaled payload for task '{task_id}' round {round}"))?;

    let budget = DeadlineBudget::starting_now(clock, config.deadline_window());
    let policy = RetryPolicy::new(
        StageKind::Notify,
        config.retry_for(StageKind::Notify, budget.remaining()),
    );
    let attempted = policy.run_at_least_once(&budget, |_| {
        notifier.notify(&descriptor.evaluation_url, &payload)
    });
    let delivered = !attempted.outcome.is_failed();
    if delivered {
        info!(task_id, round, attempts = attempted.attempts, "notification re-sent");
    } else {
        warn!(task_id, round, attempts = attempted.attempts, "re-send not delivered");
    }
    Ok(ResendOutcome {
        destination: descriptor.evaluation_url,
        delivered,
        attempts: attempted.attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::types::{NotificationPayload, RunStatus, SealedPayload};
    use crate::test_support::{ManualClock, RecordingNotifier, descriptor};

    #[test]
    fn resends_journaled_body_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let journal = RunJournal::new(temp.path());
        let clock = Arc::new(ManualClock::new());
        let desc = descriptor("site", 1, &clock, Duration::from_secs(60));
        journal.write_descriptor(&desc).expect("descriptor");
        let sealed = SealedPayload::seal(NotificationPayload {
            email: desc.email.clone(),
            task: desc.task_id.clone(),
            round: 1,
            nonce: desc.nonce.clone(),
            repo_url: None,
            commit_sha: None,
            pages_url: Some("https://octo.github.io/site/".to_string()),
            status: RunStatus::Pending,
        })
        .expect("seal");
        journal.write_payload("site", 1, &sealed).expect("payload");

        let notifier = RecordingNotifier::accepting();
        let outcome = resend(
            &journal,
            &notifier,
            &OrchestratorConfig::default(),
            clock,
            "site",
            1,
        )
        .expect("resend");

        assert!(outcome.delivered);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            notifier.deliveries(),
            vec![(desc.evaluation_url.clone(), sealed.body().to_string())]
        );
    }

    #[test]
    fn missing_run_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let journal = RunJournal::new(temp.path());
        let err = resend(
            &journal,
            &RecordingNotifier::accepting(),
            &OrchestratorConfig::default(),
            Arc::new(ManualClock::new()),
            "ghost",
            4,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("no journaled run"));
    }
}
