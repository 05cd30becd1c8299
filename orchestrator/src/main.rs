//! Deadline-bounded static-site orchestrator.
//!
//! State lives in `.orchestrator/` under the workspace root: config, revision
//! records, the request queue, run journals and local dry-run artifacts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use orchestrator::admit::{admit, parse_request};
use orchestrator::core::budget::{Clock, SystemClock};
use orchestrator::core::types::RevisionRecord;
use orchestrator::drain::drain_queue;
use orchestrator::engine::{Engine, RunReport};
use orchestrator::exit_codes;
use orchestrator::io::config::{OrchestratorConfig, load_config};
use orchestrator::io::journal::RunJournal;
use orchestrator::io::layout::{OrchestratorPaths, init_workspace};
use orchestrator::io::queue::SpoolQueue;
use orchestrator::io::revision_store::{FileRevisionStore, RevisionStore};
use orchestrator::logging;
use orchestrator::resend::resend;
use orchestrator::stages::Stages;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Deadline-bounded orchestration of site generation, publication and notification"
)]
struct Cli {
    /// Workspace root containing `.orchestrator/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with a default config.
    Init {
        /// Rewrite the config of an existing workspace.
        #[arg(short, long)]
        force: bool,
    },
    /// Admit a request and run it to completion in the foreground.
    Run {
        /// Task request JSON file.
        request: PathBuf,
    },
    /// Validate a request and add it to the queue.
    Enqueue {
        /// Task request JSON file.
        request: PathBuf,
    },
    /// Run every queued request; rounds of one task run in order.
    Drain {
        /// Maximum number of tasks processed concurrently.
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },
    /// Print the revision record and journaled runs of a task.
    Show {
        task: String,
    },
    /// Re-deliver the journaled notification of a run.
    Resend {
        task: String,
        round: u32,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Run { request } => cmd_run(&cli.root, &request),
        Command::Enqueue { request } => cmd_enqueue(&cli.root, &request),
        Command::Drain { workers } => cmd_drain(&cli.root, workers),
        Command::Show { task } => cmd_show(&cli.root, &task),
        Command::Resend { task, round } => cmd_resend(&cli.root, &task, round),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, force)?;
    println!("{}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, request_path: &Path) -> Result<i32> {
    let (paths, config) = open_workspace(root)?;
    let request = parse_request(&read_request(request_path)?)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let descriptor = admit(&request, Utc::now(), config.deadline_window(), clock.as_ref());
    let engine = build_engine(&paths, config, clock);
    let report = engine.run(&descriptor);
    print_json(&report)?;
    Ok(exit_code_for(std::slice::from_ref(&report)))
}

fn cmd_enqueue(root: &Path, request_path: &Path) -> Result<i32> {
    let (paths, _config) = open_workspace(root)?;
    let request = parse_request(&read_request(request_path)?)?;
    let path = SpoolQueue::new(&paths.queue_dir).enqueue(&request, Utc::now())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_drain(root: &Path, workers: usize) -> Result<i32> {
    if workers == 0 {
        bail!("--workers must be > 0");
    }
    let (paths, config) = open_workspace(root)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = SpoolQueue::new(&paths.queue_dir);
    let engine = build_engine(&paths, config, clock.clone());
    let reports = drain_queue(&engine, &queue, clock.as_ref(), workers)?;
    for report in &reports {
        println!("{}", serde_json::to_string(report).context("serialize run report")?);
    }
    Ok(exit_code_for(&reports))
}

#[derive(Serialize)]
struct TaskOverview {
    task: String,
    revision: Option<RevisionRecord>,
    runs: Vec<Value>,
}

fn cmd_show(root: &Path, task: &str) -> Result<i32> {
    let (paths, _config) = open_workspace(root)?;
    let revision = FileRevisionStore::new(&paths.revisions_dir).load(task)?;
    let journal = RunJournal::new(&paths.runs_dir);
    let mut runs = Vec::new();
    for round in journal.rounds(task)? {
        match journal.read_report(task, round) {
            Ok(report) => runs.push(report),
            Err(_) => runs.push(serde_json::json!({ "round": round, "status": "incomplete" })),
        }
    }
    print_json(&TaskOverview {
        task: task.to_string(),
        revision,
        runs,
    })?;
    Ok(exit_codes::OK)
}

fn cmd_resend(root: &Path, task: &str, round: u32) -> Result<i32> {
    let (paths, config) = open_workspace(root)?;
    let stages = Stages::from_config(&paths, &config);
    let journal = RunJournal::new(&paths.runs_dir);
    let outcome = resend(
        &journal,
        stages.notifier.as_ref(),
        &config,
        Arc::new(SystemClock),
        task,
        round,
    )?;
    println!(
        "{} {} (attempts: {})",
        if outcome.delivered { "delivered to" } else { "not delivered to" },
        outcome.destination,
        outcome.attempts
    );
    Ok(if outcome.delivered {
        exit_codes::OK
    } else {
        exit_codes::DEGRADED
    })
}

fn open_workspace(root: &Path) -> Result<(OrchestratorPaths, OrchestratorConfig)> {
    let paths = OrchestratorPaths::new(root);
    if !paths.state_dir.is_dir() {
        bail!(
            "{} not found (run `orchestrator init` first)",
            paths.state_dir.display()
        );
    }
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn build_engine(
    paths: &OrchestratorPaths,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
) -> Engine {
    let stages = Stages::from_config(paths, &config);
    let store = Arc::new(FileRevisionStore::new(&paths.revisions_dir));
    Engine::new(config, store, stages, clock).with_journal(RunJournal::new(&paths.runs_dir))
}

fn read_request(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{out}");
    Ok(())
}

fn exit_code_for(reports: &[RunReport]) -> i32 {
    if reports.iter().any(RunReport::is_degraded) {
        exit_codes::DEGRADED
    } else {
        exit_codes::OK
    }
}
