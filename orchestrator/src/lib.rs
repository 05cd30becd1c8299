//! Deadline-bounded stage orchestration for static-site tasks.
//!
//! A task request ("build this site for task T, round R") is admitted with a
//! fixed deadline and driven through generation, publication and readiness
//! polling, ending in exactly one notification even when stages fail.
//!
//! - **[`core`]**: Pure, deterministic logic (deadline budget, retry policy,
//!   naming, data model). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, revision store, journal,
//!   queue, child processes, stage adapters).
//!
//! Orchestration modules ([`admit`], [`engine`], [`drain`], [`resend`]) tie
//! core logic to I/O to implement CLI commands.

pub mod admit;
pub mod core;
pub mod drain;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod resend;
pub mod stages;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
