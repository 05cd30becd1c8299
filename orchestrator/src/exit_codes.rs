//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; every run completed with a confirmed site and a
/// delivered notification.
pub const OK: i32 = 0;
/// Invalid request, config or workspace, or any other command error.
pub const INVALID: i32 = 1;
/// At least one run finished degraded (fallback, pending or undelivered).
pub const DEGRADED: i32 = 2;
