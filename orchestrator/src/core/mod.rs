//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. Time enters only through the
//! [`budget::Clock`] seam so tests can drive it manually.

pub mod budget;
pub mod naming;
pub mod retry;
pub mod types;
