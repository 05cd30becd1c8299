//! Spool queue drained by concurrent workers against one shared engine.

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use orchestrator::admit::parse_request;
use orchestrator::core::types::RunStatus;
use orchestrator::drain::drain_queue;
use orchestrator::engine::{Engine, RunMode};
use orchestrator::io::attachments::UnconfiguredFetcher;
use orchestrator::io::config::OrchestratorConfig;
use orchestrator::io::queue::SpoolQueue;
use orchestrator::io::revision_store::{FileRevisionStore, RevisionStore};
use orchestrator::stages::Stages;
use orchestrator::test_support::{
    ManualClock, RecordingNotifier, ScriptedGenerator, ScriptedProbe, ScriptedPublisher,
    sample_manifest,
};

fn request(task: &str, round: u32) -> String {
    json!({
        "email": "student@example.com",
        "secret": "hunter2",
        "task": task,
        "round": round,
        "nonce": format!("{task}-{round}"),
        "brief": "Render the attached CSV as a table",
        "checks": ["Page shows a table"],
        "evaluation_url": "https://eval.test/notify"
    })
    .to_string()
}

#[test]
fn drains_rounds_in_order_per_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = SpoolQueue::new(temp.path().join("queue"));
    let now = Utc::now();
    // Round 2 of `alpha` is enqueued first; it must still run after round 1.
    for (task, round) in [("alpha", 2), ("alpha", 1), ("beta", 1)] {
        let parsed = parse_request(&request(task, round)).expect("valid request");
        queue.enqueue(&parsed, now).expect("enqueue");
    }

    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(FileRevisionStore::new(temp.path().join("revisions")));
    let notifier = Arc::new(RecordingNotifier::accepting());
    let stages = Stages {
        generator: Arc::new(ScriptedGenerator::succeeding(sample_manifest())),
        publisher: Arc::new(ScriptedPublisher::succeeding()),
        probe: Arc::new(ScriptedProbe::ready_after(0)),
        notifier: notifier.clone(),
        fetcher: Arc::new(UnconfiguredFetcher),
    };
    let engine = Engine::new(
        OrchestratorConfig::default(),
        store.clone(),
        stages,
        clock.clone(),
    );

    let reports = drain_queue(&engine, &queue, clock.as_ref(), 2).expect("drain");

    let order: Vec<(&str, u32)> = reports
        .iter()
        .map(|r| (r.task_id.as_str(), r.round))
        .collect();
    assert_eq!(order, vec![("alpha", 1), ("alpha", 2), ("beta", 1)]);
    assert_eq!(reports[0].mode, RunMode::Create);
    assert_eq!(reports[1].mode, RunMode::Reuse { stale: false });
    assert!(reports.iter().all(|r| r.status == RunStatus::Ready));

    let alpha = store.load("alpha").expect("load").expect("record");
    assert_eq!(alpha.last_round, 2);
    assert_eq!(notifier.deliveries().len(), 3);
    assert!(
        notifier
            .deliveries()
            .iter()
            .all(|(_, body)| !body.contains("hunter2"))
    );

    assert!(queue.pending().expect("pending").is_empty());
    let done = fs::read_dir(queue.done_dir()).expect("done dir").count();
    assert_eq!(done, 3);
}

#[test]
fn unreadable_entries_are_set_aside() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("queue");
    fs::create_dir_all(&dir).expect("queue dir");
    fs::write(dir.join("0000000000001-broken-r1.json"), "{not json").expect("write");

    let queue = SpoolQueue::new(&dir);
    assert!(queue.pending().expect("pending").is_empty());
    assert!(queue.rejected_dir().join("0000000000001-broken-r1.json").is_file());

    let clock = Arc::new(ManualClock::new());
    let stages = Stages {
        generator: Arc::new(ScriptedGenerator::succeeding(sample_manifest())),
        publisher: Arc::new(ScriptedPublisher::succeeding()),
        probe: Arc::new(ScriptedProbe::ready_after(0)),
        notifier: Arc::new(RecordingNotifier::accepting()),
        fetcher: Arc::new(UnconfiguredFetcher),
    };
    let engine = Engine::new(
        OrchestratorConfig::default(),
        Arc::new(FileRevisionStore::new(temp.path().join("revisions"))),
        stages,
        clock.clone(),
    );
    let reports = drain_queue(&engine, &queue, clock.as_ref(), 4).expect("drain");
    assert!(reports.is_empty());
}
