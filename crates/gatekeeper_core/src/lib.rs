//! Core policy-gate logic: rule classification, per-rule circuit breakers,
//! the override ledger, and threshold auto-tuning.
//!
//! Pure and deterministic. Persistence, locking, and the CLI live in
//! `gatekeeper_infra`.

pub mod breaker;
pub mod gate;
pub mod ledger;
pub mod rules;
pub mod state;
pub mod tuning;

pub use gate::{AdminError, GateDecision, GateEvent, GateOutcome, PolicyGate, RuleReport};
pub use rules::{RuleCatalog, RuleConfigError};
pub use state::PolicyState;
