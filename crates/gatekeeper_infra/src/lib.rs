//! Infrastructure for the policy gate: durable state, locking, configuration,
//! logging, and the lock-scoped runner behind the `gatekeeper` CLI.

#[path = "../config/mod.rs"]
pub mod config;
pub mod logging;
pub mod runner;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use runner::{GateRunner, ResetOutcome, ResetScope, RunnerError, StatusReport};
pub use store::{EvaluationLog, EvaluationRecord, LoadOutcome, PolicyStore, StoreError};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
