//! Lock-scoped gate runner: wires `PolicyGate` to the Policy Store.
//!
//! `evaluate` never fails. A lock timeout, an I/O error, or an unreadable document all
//! degrade to ALLOW with an operator-facing log event; internal errors never reach the
//! user-visible decision message. Administrative operations, by contrast, surface
//! errors and refuse to write over an unreadable document.

use std::path::PathBuf;

use gatekeeper_core::breaker::OutcomeApplied;
use gatekeeper_core::ledger::{PruneSummary, RetentionPolicy};
use gatekeeper_core::tuning::TuningAdjustment;
use gatekeeper_core::{AdminError, GateDecision, GateEvent, PolicyGate, RuleReport};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, GatekeeperConfig};
use crate::store::{EvaluationLog, EvaluationRecord, PolicyStore, StoreError};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Admin(#[from] AdminError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    Rule(String),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Where an unreadable document was moved before the reset, if anywhere.
    pub quarantined: Option<PathBuf>,
}

/// Whole-domain status for `report`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub domain: String,
    pub state_readable: bool,
    pub unreadable_reason: Option<String>,
    pub turn_count: u64,
    pub last_tuning_ms: Option<u64>,
    pub override_events: usize,
    pub catastrophic_grants: usize,
    pub evaluation_log_lines: usize,
    pub rules: Vec<RuleReport>,
    pub tuning_history: Vec<TuningAdjustment>,
}

#[derive(Debug, Clone)]
pub struct GateRunner {
    gate: PolicyGate,
    store: PolicyStore,
    log: EvaluationLog,
    retention: RetentionPolicy,
}

impl GateRunner {
    pub fn new(gate: PolicyGate, store: PolicyStore, retention: RetentionPolicy) -> Self {
        let log = EvaluationLog::new(store.events_path());
        Self {
            gate,
            store,
            log,
            retention,
        }
    }

    pub fn from_config(config: &GatekeeperConfig) -> Result<Self, ConfigError> {
        let store = PolicyStore::new(&config.state_dir, &config.domain, config.lock_timeout);
        Ok(Self::new(config.build_gate()?, store, config.retention))
    }

    pub fn gate(&self) -> &PolicyGate {
        &self.gate
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn evaluation_log(&self) -> &EvaluationLog {
        &self.log
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Handle one host event under the store lock. Always returns a decision.
    pub fn evaluate(&self, event: &GateEvent, now_ms: u64) -> GateDecision {
        let result = self.store.transact(|state| {
            let outcome = self.gate.handle(event, state, now_ms);
            (outcome, state.turn_count)
        });
        match result {
            Ok(tx) => {
                let (outcome, turn) = tx.value;
                let mut record = EvaluationRecord::from_outcome(event, &outcome, turn, now_ms);
                record.degraded = !tx.persisted;
                if let Err(err) = self.log.append(&record) {
                    warn!(error = %err, "evaluation log append failed");
                }
                outcome.decision
            }
            Err(StoreError::LockTimeout { path, waited_ms }) => {
                warn!(
                    lock = %path.display(),
                    waited_ms,
                    "policy store lock timed out; failing open"
                );
                GateDecision::fail_open()
            }
            Err(err) => {
                error!(error = %err, "policy store failure; failing open");
                GateDecision::fail_open()
            }
        }
    }

    pub fn report_outcome(
        &self,
        rule_id: &str,
        target: &str,
        succeeded: bool,
        now_ms: u64,
    ) -> Result<OutcomeApplied, RunnerError> {
        Ok(self.store.transact_strict(|state| {
            self.gate
                .report_outcome(state, rule_id, target, succeeded, now_ms)
        })??)
    }

    pub fn record_override(
        &self,
        rule_id: &str,
        target: &str,
        reason_tag: &str,
        session_id: Option<&str>,
        now_ms: u64,
    ) -> Result<(), RunnerError> {
        Ok(self.store.transact_strict(|state| {
            self.gate
                .record_override(state, rule_id, target, reason_tag, session_id, now_ms)
        })??)
    }

    pub fn force_false_positive(
        &self,
        rule_id: &str,
        target: Option<&str>,
        reason_tag: &str,
        now_ms: u64,
    ) -> Result<(), RunnerError> {
        Ok(self.store.transact_strict(|state| {
            self.gate
                .force_false_positive(state, rule_id, target, reason_tag, now_ms)
        })??)
    }

    pub fn set_threshold(&self, rule_id: &str, value: f64, now_ms: u64) -> Result<f64, RunnerError> {
        Ok(self
            .store
            .transact_strict(|state| self.gate.set_threshold(state, rule_id, value, now_ms))??)
    }

    /// Reset one rule or all rules. `All` first quarantines an unreadable document so
    /// a fresh one can be written without destroying the old bytes.
    pub fn reset(&self, scope: &ResetScope, now_ms: u64) -> Result<ResetOutcome, RunnerError> {
        match scope {
            ResetScope::Rule(rule_id) => {
                self.store
                    .transact_strict(|state| self.gate.reset_rule(state, rule_id))??;
                Ok(ResetOutcome { quarantined: None })
            }
            ResetScope::All => {
                let quarantined = self.store.quarantine(now_ms)?;
                self.store.transact_strict(|state| {
                    self.gate.reset_all(state);
                    Ok::<_, AdminError>(())
                })??;
                Ok(ResetOutcome { quarantined })
            }
        }
    }

    /// Override retention sweep. The gate never runs this on its own.
    pub fn prune_overrides(
        &self,
        now_ms: u64,
        policy: RetentionPolicy,
    ) -> Result<PruneSummary, RunnerError> {
        let removed = self.store.transact_strict(|state| {
            Ok::<_, AdminError>(self.gate.prune_overrides(state, now_ms, policy))
        })??;
        info!(
            events = removed.events,
            grants = removed.grants,
            "override retention sweep finished"
        );
        Ok(removed)
    }

    pub fn report(&self, now_ms: u64) -> Result<StatusReport, RunnerError> {
        let loaded = self.store.read()?;
        let evaluation_log_lines = self.log.line_count().unwrap_or_else(|err| {
            warn!(error = %err, "evaluation log unreadable");
            0
        });
        let state = loaded.state();
        Ok(StatusReport {
            domain: self.store.domain().to_string(),
            state_readable: !loaded.is_unreadable(),
            unreadable_reason: loaded.unreadable_reason().map(str::to_string),
            turn_count: state.turn_count,
            last_tuning_ms: state.last_tuning_ms,
            override_events: state.overrides.events().len(),
            catastrophic_grants: state.overrides.grants().len(),
            evaluation_log_lines,
            rules: self.gate.report(state, now_ms),
            tuning_history: state.tuning_history.clone(),
        })
    }
}
