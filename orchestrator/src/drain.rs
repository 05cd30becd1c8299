//! Concurrent processing of the spool queue.
//!
//! Queued requests are grouped by task. Groups run in parallel on scoped
//! threads, at most `workers` at a time; rounds within one group run in
//! round order on a single thread, so two rounds of the same task never
//! overlap.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::thread;

use anyhow::{Result, anyhow};
use tracing::{error, info};

use crate::admit::admit;
use crate::core::budget::Clock;
use crate::engine::{Engine, RunReport};
use crate::io::queue::{QueuedRequest, SpoolQueue};

/// Drain every pending entry. Returns the reports ordered by task and round.
pub fn drain_queue(
    engine: &Engine,
    queue: &SpoolQueue,
    clock: &dyn Clock,
    workers: usize,
) -> Result<Vec<RunReport>> {
    let groups = group_by_task(queue.pending()?);
    if groups.is_empty() {
        info!("queue is empty");
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, groups.len());
    info!(groups = groups.len(), workers, "draining queue");

    let work = Mutex::new(groups.into_iter().collect::<VecDeque<_>>());
    let reports = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                while let Some(group) = next_group(&work) {
                    for item in group {
                        let report = run_item(engine, queue, clock, &item);
                        if let Ok(mut reports) = reports.lock() {
                            reports.push(report);
                        }
                    }
                }
            });
        }
    });

    let mut reports = reports
        .into_inner()
        .map_err(|_| anyhow!("drain report lock poisoned"))?;
    reports.sort_by(|a, b| (&a.task_id, a.round).cmp(&(&b.task_id, b.round)));
    Ok(reports)
}

fn next_group(work: &Mutex<VecDeque<Vec<QueuedRequest>>>) -> Option<Vec<QueuedRequest>> {
    work.lock().ok()?.pop_front()
}

fn run_item(
    engine: &Engine,
    queue: &SpoolQueue,
    clock: &dyn Clock,
    item: &QueuedRequest,
) -> RunReport {
    let envelope = &item.envelope;
    let descriptor = admit(
        &envelope.request,
        envelope.admitted_at,
        engine.config().deadline_window(),
        clock,
    );
    let report = engine.run(&descriptor);
    if let Err(err) = queue.complete(item) {
        error!(
            path = %item.path.display(),
            err = %format!("{err:#}"),
            "could not move processed queue entry"
        );
    }
    report
}

/// Entries grouped by task id, each group sorted by round then admission.
fn group_by_task(items: Vec<QueuedRequest>) -> Vec<Vec<QueuedRequest>> {
    let mut groups: BTreeMap<String, Vec<QueuedRequest>> = BTreeMap::new();
    for item in items {
        groups
            .entry(item.envelope.request.task.clone())
            .or_default()
            .push(item);
    }
    groups
        .into_values()
        .map(|mut group| {
            group.sort_by_key(|item| (item.envelope.request.round, item.envelope.admitted_at));
            group
        })
        .collect()
}
