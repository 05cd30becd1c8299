//! Bounded retry with exponential backoff, capped by the run's deadline.
//!
//! One [`RetryPolicy`] wraps every stage invocation. Attempt `n` (1-indexed)
//! that fails is followed by a delay of `min(base * 2^(n-1), max)` before
//! attempt `n + 1`; no delay follows the final attempt. Only transient
//! failures are retried.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::budget::DeadlineBudget;
use crate::core::types::{StageError, StageOutcome};

/// Stage kinds that carry their own retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Generation,
    Publish,
    Poll,
    Notify,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Publish => "publish",
            Self::Poll => "poll",
            Self::Notify => "notify",
        }
    }
}

/// Per-kind retry settings (TOML: `max_attempts`, `base_delay_ms`, `max_delay_ms`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Constant-interval polling sized so `attempts * interval` covers `window`.
    pub fn polling(interval: Duration, window: Duration) -> Self {
        let interval_ms = (interval.as_millis() as u64).max(1);
        let window_ms = window.as_millis() as u64;
        let attempts = window_ms / interval_ms + 1;
        Self {
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            base_delay_ms: interval_ms,
            max_delay_ms: interval_ms,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay()
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay())
    }

    pub fn validate(&self, label: &str) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("{label}.max_attempts must be > 0");
        }
        if self.max_delay_ms < self.base_delay_ms {
            anyhow::bail!("{label}.max_delay_ms must be >= base_delay_ms");
        }
        Ok(())
    }
}

/// Final outcome of a retried stage plus the number of attempts made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub outcome: StageOutcome<T>,
    pub attempts: u32,
}

/// Retry policy for one stage kind.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    kind: StageKind,
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(kind: StageKind, config: RetryConfig) -> Self {
        Self { kind, config }
    }

    /// Run `op` until it succeeds, fails terminally, exhausts `max_attempts`,
    /// or the budget runs out. No attempt starts once the budget is zero.
    pub fn run<T, F>(&self, budget: &DeadlineBudget, op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Result<StageOutcome<T>>,
    {
        self.execute(budget, false, op)
    }

    /// Like [`RetryPolicy::run`], but the first attempt is made even when the
    /// budget is already exhausted. Retries still stop at the deadline.
    pub fn run_at_least_once<T, F>(&self, budget: &DeadlineBudget, op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Result<StageOutcome<T>>,
    {
        self.execute(budget, true, op)
    }

    fn execute<T, F>(&self, budget: &DeadlineBudget, first_guaranteed: bool, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Result<StageOutcome<T>>,
    {
        let stage = self.kind.as_str();
        let mut last: Option<StageOutcome<T>> = None;
        let mut attempts = 0u32;

        for attempt in 1..=self.config.max_attempts {
            let guaranteed = first_guaranteed && attempt == 1;
            if budget.expired() && !guaranteed {
                info!(stage, attempt, "deadline reached, no further attempts");
                break;
            }

            attempts = attempt;
            let outcome = match op(attempt) {
                Ok(outcome) => outcome,
                Err(err) => StageOutcome::failed(classify(&err)),
            };

            match outcome {
                StageOutcome::Success { .. } => {
                    info!(stage, attempt, "attempt succeeded");
                    return Attempted { outcome, attempts };
                }
                StageOutcome::Degraded { ref reason, .. } => {
                    warn!(stage, attempt, reason = %reason, "attempt degraded");
                    last = Some(outcome);
                }
                StageOutcome::Failed { ref reason } => {
                    warn!(stage, attempt, error = %reason, "attempt failed");
                    let retryable = reason.is_retryable();
                    last = Some(outcome);
                    if !retryable {
                        break;
                    }
                }
            }

            if attempt == self.config.max_attempts {
                break;
            }
            let delay = self.config.delay_after(attempt);
            if delay >= budget.remaining() {
                info!(
                    stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "next attempt would start past the deadline"
                );
                break;
            }
            debug!(stage, attempt, delay_ms = delay.as_millis() as u64, "backing off");
            budget.clock().sleep(delay);
        }

        let outcome = last.unwrap_or_else(|| {
            StageOutcome::failed(StageError::deadline_exceeded(format!(
                "no {stage} attempt made before the deadline"
            )))
        });
        Attempted { outcome, attempts }
    }
}

/// Map an adapter error to a stage failure. Errors that are not a
/// [`StageError`] count as transient.
fn classify(err: &anyhow::Error) -> StageError {
    match err.downcast_ref::<StageError>() {
        Some(stage_error) => stage_error.clone(),
        None => StageError::transient(format!("{err:#}")),
    }
}
