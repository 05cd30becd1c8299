//! Request intake: validate a task request and fix its run deadline.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::core::budget::{Clock, deadline_after};
use crate::core::types::{Attachment, RequestPayload, RunDescriptor};

const TASK_REQUEST_SCHEMA: &str = include_str!("../../schemas/task_request/v1.schema.json");

/// Inbound unit of work as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub email: String,
    /// Caller credential. Checked upstream, never journaled or published.
    pub secret: String,
    pub task: String,
    pub round: u32,
    pub nonce: String,
    pub brief: String,
    #[serde(default)]
    pub checks: Vec<String>,
    pub evaluation_url: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TaskRequest {
    pub fn payload(&self) -> RequestPayload {
        RequestPayload {
            brief: self.brief.clone(),
            checks: self.checks.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

/// Parse a raw JSON request and validate it against the bundled schema.
pub fn parse_request(raw: &str) -> Result<TaskRequest> {
    let instance: Value = serde_json::from_str(raw).context("parse task request json")?;
    validate_schema(&instance)?;
    serde_json::from_value(instance).context("deserialize task request")
}

/// Validate JSON instance against the task request schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(TASK_REQUEST_SCHEMA).context("parse task request schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile task request schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("task request is invalid:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Turn a validated request into a run descriptor.
///
/// The deadline is `admitted_at + window`. Time already spent since
/// `admitted_at` (for example while queued) is taken off the monotonic
/// deadline, so a request admitted long ago starts with an exhausted budget.
pub fn admit(
    request: &TaskRequest,
    admitted_at: DateTime<Utc>,
    window: Duration,
    clock: &dyn Clock,
) -> RunDescriptor {
    let waited = (Utc::now() - admitted_at).to_std().unwrap_or(Duration::ZERO);
    let remaining = window.saturating_sub(waited);
    let window_delta =
        chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
    let deadline_at = admitted_at
        .checked_add_signed(window_delta)
        .unwrap_or(admitted_at);

    info!(
        task_id = %request.task,
        round = request.round,
        remaining_ms = remaining.as_millis() as u64,
        "admitted run"
    );
    RunDescriptor {
        task_id: request.task.clone(),
        round: request.round,
        nonce: request.nonce.clone(),
        email: request.email.clone(),
        evaluation_url: request.evaluation_url.clone(),
        admitted_at,
        deadline_at,
        deadline: deadline_after(clock.now(), remaining),
        request: request.payload(),
    }
}
