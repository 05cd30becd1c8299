//! Shared deadline budget for deterministic orchestration.
//!
//! Every run owns one [`DeadlineBudget`] anchored at admission. Stage
//! invocations and retry decisions consult it before doing any work; once it
//! reaches zero no new stage attempt is started.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Source of monotonic time and suspension.
///
/// Production code uses [`SystemClock`]. Tests substitute a manual clock so
/// backoff schedules can be asserted without real sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Suspend the current run for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant::now`] and [`thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Longest window a budget can span. Larger requests are clamped.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + window`, clamped to [`MAX_WINDOW`]; never overflows.
pub fn deadline_after(now: Instant, window: Duration) -> Instant {
    now.checked_add(window.min(MAX_WINDOW)).unwrap_or(now)
}

/// Remaining wall-clock allowance for one run.
#[derive(Clone)]
pub struct DeadlineBudget {
    clock: Arc<dyn Clock>,
    anchor: Instant,
    deadline: Instant,
}

impl DeadlineBudget {
    /// Budget of `total` starting now.
    pub fn starting_now(clock: Arc<dyn Clock>, total: Duration) -> Self {
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            deadline: deadline_after(anchor, total),
        }
    }

    /// Budget that ends at an absolute `deadline`.
    pub fn until(clock: Arc<dyn Clock>, deadline: Instant) -> Self {
        let anchor = clock.now().min(deadline);
        Self {
            clock,
            anchor,
            deadline,
        }
    }

    /// Time left before the deadline; floors at zero.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(self.clock.now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Time consumed since the budget was anchored.
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.anchor)
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

impl std::fmt::Debug for DeadlineBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineBudget")
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;

    #[test]
    fn remaining_floors_at_zero() {
        let clock = Arc::new(ManualClock::new());
        let budget = DeadlineBudget::starting_now(clock.clone(), Duration::from_secs(5));

        clock.advance(Duration::from_secs(3));
        assert_eq!(budget.remaining(), Duration::from_secs(2));
        assert!(!budget.expired());

        clock.advance(Duration::from_secs(10));
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(budget.expired());
    }

    #[test]
    fn remaining_never_increases() {
        let clock = Arc::new(ManualClock::new());
        let budget = DeadlineBudget::starting_now(clock.clone(), Duration::from_secs(60));

        let mut previous = budget.remaining();
        for step in [1, 0, 7, 30, 0, 45] {
            clock.advance(Duration::from_secs(step));
            let current = budget.remaining();
            assert!(current <= previous);
            previous = current;
        }
        assert!(previous.is_zero());
    }

    #[test]
    fn until_past_deadline_is_already_expired() {
        let clock = Arc::new(ManualClock::new());
        let deadline = clock.now();
        clock.advance(Duration::from_secs(1));

        let budget = DeadlineBudget::until(clock, deadline);
        assert!(budget.expired());
    }

    #[test]
    fn oversized_window_is_clamped_instead_of_overflowing() {
        let clock = Arc::new(ManualClock::new());
        let budget = DeadlineBudget::starting_now(clock, Duration::MAX);
        assert_eq!(budget.remaining(), MAX_WINDOW);
    }
}
