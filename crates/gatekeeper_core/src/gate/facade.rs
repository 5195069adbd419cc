//! Gate Facade: the single entry point the host calls.
//!
//! `handle` is a pure state transition, `(event, state) -> (outcome, state')`. The
//! caller owns loading and persisting `PolicyState` around it; nothing here does I/O.
//!
//! Per event:
//! 1. bump the turn counter (the clock for event-bounded windows)
//! 2. classify; contain predicate panics
//! 3. per violation: count a detection, then either check for a catastrophic grant
//!    or record into the rule's window and evaluate its breaker
//! 4. the first denying violation decides; a non-empty `override_reason` converts
//!    every denial of this event into a recorded override
//! 5. an event nothing denies admits at most one probe: the first rule whose
//!    cooldown has elapsed goes HalfOpen, any other due breaker stays Open
//! 6. every `tune_interval` events, run the auto-tuner

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use super::decision::{GateDecision, ms_to_retry_secs};
use super::event::GateEvent;
use crate::breaker::{BreakerAssessment, CircuitPhase, OutcomeApplied, Tick};
use crate::ledger::{OverrideEvent, PruneSummary, RetentionPolicy};
use crate::rules::{
    ClassificationFault, RuleCatalog, RuleCategory, RuleDefinition, Violation, classify,
};
use crate::state::PolicyState;
use crate::tuning::{AdjustmentSource, TunerConfig, TuningAdjustment, round_threshold};

pub const TUNE_INTERVAL_DEFAULT: u64 = 100;
pub const TUNING_HISTORY_MAX_DEFAULT: usize = 50;

/// Target recorded for a false positive reported without one.
pub const UNSPECIFIED_TARGET: &str = "*";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdminError {
    #[error("unknown rule: {id}")]
    UnknownRule { id: String },
    #[error("rule {id} is catastrophic; its threshold is fixed at 1")]
    NotTunable { id: String },
    #[error("invalid threshold value: {value}")]
    InvalidThreshold { value: f64 },
}

/// Everything one `handle` call produced, for the caller's log stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub decision: GateDecision,
    pub violations: Vec<Violation>,
    pub faults: Vec<ClassificationFault>,
    /// Rules whose denial this event overrode.
    pub overrides_recorded: Vec<String>,
    pub tuned: Vec<TuningAdjustment>,
}

/// One row of the administrative report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleReport {
    pub rule_id: String,
    pub category: RuleCategory,
    pub description: String,
    pub threshold: f64,
    pub range_min: f64,
    pub range_max: f64,
    pub window: String,
    pub phase: CircuitPhase,
    pub attempt_index: u32,
    pub retry_after_seconds: Option<u64>,
    pub window_count: usize,
    pub detections: u64,
    pub overrides: u64,
    pub false_positive_rate: f64,
    pub lifetime_detections: u64,
    pub lifetime_overrides: u64,
    pub last_tuned_at_ms: Option<u64>,
    pub trips_total: u64,
    pub grants: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Verdict {
    Allow { count: usize, threshold: f64 },
    /// Cooldown elapsed; not yet admitted as this event's probe.
    ProbeDue,
    Probe,
    Deny {
        count: usize,
        threshold: f64,
        retry_after_ms: Option<u64>,
    },
}

#[derive(Debug, Clone)]
pub struct PolicyGate {
    catalog: RuleCatalog,
    tuner: TunerConfig,
    tune_interval: u64,
    tuning_history_max: usize,
}

impl PolicyGate {
    pub fn new(catalog: RuleCatalog) -> Self {
        Self {
            catalog,
            tuner: TunerConfig::default(),
            tune_interval: TUNE_INTERVAL_DEFAULT,
            tuning_history_max: TUNING_HISTORY_MAX_DEFAULT,
        }
    }

    pub fn with_tuner(mut self, tuner: TunerConfig) -> Self {
        self.tuner = tuner;
        self
    }

    /// Run the tuner every `interval` processed events. Zero disables periodic tuning.
    pub fn with_tune_interval(mut self, interval: u64) -> Self {
        self.tune_interval = interval;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.tuning_history_max = limit;
        self
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn tuner_config(&self) -> &TunerConfig {
        &self.tuner
    }

    pub fn handle(&self, event: &GateEvent, state: &mut PolicyState, now_ms: u64) -> GateOutcome {
        state.turn_count += 1;
        let tick = Tick::new(now_ms, state.turn_count);

        let classification = classify(event, &self.catalog, now_ms);
        for fault in &classification.faults {
            error!(
                rule_id = %fault.rule_id,
                subject = %event.target,
                panic = %fault.message,
                "rule predicate panicked; rule skipped for this event"
            );
        }

        let mut verdicts = Vec::with_capacity(classification.violations.len());
        for violation in &classification.violations {
            let Some(rule) = self.catalog.get(&violation.rule_id) else {
                continue;
            };
            state.tuner.entry(rule).record_detection();
            let verdict = if rule.is_catastrophic() {
                self.evaluate_catastrophic(rule, event, state)
            } else {
                self.evaluate_threshold(rule, state, tick)
            };
            verdicts.push((rule, verdict));
        }

        let mut overrides_recorded = Vec::new();
        let denied = verdicts
            .iter()
            .any(|(_, verdict)| matches!(verdict, Verdict::Deny { .. }));
        let decision = match (denied, event.override_requested()) {
            (true, Some(reason)) => {
                let session = Some(event.session_id.as_str()).filter(|s| !s.is_empty());
                for (rule, verdict) in &verdicts {
                    if matches!(verdict, Verdict::Deny { .. }) {
                        self.apply_override(state, rule, &event.target, reason, session, true, now_ms);
                        overrides_recorded.push(rule.id.clone());
                    }
                }
                GateDecision::allow(format!(
                    "override recorded for {} ({reason}); action allowed",
                    overrides_recorded.join(", ")
                ))
            }
            (true, None) => compose_decision(&verdicts, &event.target),
            (false, _) => {
                self.admit_probe(&mut verdicts, state, &event.target);
                compose_decision(&verdicts, &event.target)
            }
        };

        let tuned = if self.tune_interval > 0 && state.turn_count % self.tune_interval == 0 {
            self.run_tuner(state, now_ms)
        } else {
            Vec::new()
        };

        debug!(
            turn = state.turn_count,
            allowed = decision.allowed,
            violations = classification.violations.len(),
            "event handled"
        );

        GateOutcome {
            decision,
            violations: classification.violations,
            faults: classification.faults,
            overrides_recorded,
            tuned,
        }
    }

    fn evaluate_catastrophic(
        &self,
        rule: &RuleDefinition,
        event: &GateEvent,
        state: &PolicyState,
    ) -> Verdict {
        if state
            .overrides
            .has_grant(&rule.id, &event.target, &event.session_id)
        {
            Verdict::Allow {
                count: 1,
                threshold: 1.0,
            }
        } else {
            Verdict::Deny {
                count: 1,
                threshold: 1.0,
                retry_after_ms: None,
            }
        }
    }

    fn evaluate_threshold(
        &self,
        rule: &RuleDefinition,
        state: &mut PolicyState,
        tick: Tick,
    ) -> Verdict {
        state.windows.record(rule, tick);
        let count = state.windows.count_in_window(rule, tick);
        let threshold = state.tuner.threshold_for(rule);
        let circuit = state.circuits.entry(&rule.id);
        match circuit.assess(count, threshold, tick.now_ms) {
            BreakerAssessment::Allow => Verdict::Allow { count, threshold },
            BreakerAssessment::ProbeDue => Verdict::ProbeDue,
            BreakerAssessment::Cooling { retry_after_ms } => Verdict::Deny {
                count,
                threshold,
                retry_after_ms: Some(retry_after_ms),
            },
            BreakerAssessment::Trip => {
                let from = circuit.phase;
                let retry_after_ms = circuit.trip(&rule.cooldown_schedule, tick.now_ms);
                info!(
                    rule_id = %rule.id,
                    count,
                    threshold,
                    attempt_index = circuit.attempt_index,
                    retry_after_ms,
                    from = from.as_str(),
                    "circuit opened"
                );
                Verdict::Deny {
                    count,
                    threshold,
                    retry_after_ms: Some(retry_after_ms),
                }
            }
        }
    }

    /// Hand the event's single probe to the first due breaker. Called only when
    /// the event is allowed, so a probe is never spent on an action that did not run.
    fn admit_probe(
        &self,
        verdicts: &mut [(&RuleDefinition, Verdict)],
        state: &mut PolicyState,
        target: &str,
    ) {
        let mut admitted = false;
        for (rule, verdict) in verdicts.iter_mut() {
            if *verdict != Verdict::ProbeDue {
                continue;
            }
            if admitted {
                debug!(
                    rule_id = %rule.id,
                    subject = target,
                    "probe deferred; another rule holds this event's probe"
                );
                continue;
            }
            let circuit = state.circuits.entry(&rule.id);
            let from = circuit.phase;
            circuit.grant_probe(target);
            info!(
                rule_id = %rule.id,
                subject = target,
                from = from.as_str(),
                "circuit half-open; allowing probe"
            );
            *verdict = Verdict::Probe;
            admitted = true;
        }
    }

    /// Host feedback on a HalfOpen probe.
    pub fn report_outcome(
        &self,
        state: &mut PolicyState,
        rule_id: &str,
        target: &str,
        succeeded: bool,
        now_ms: u64,
    ) -> Result<OutcomeApplied, AdminError> {
        let rule = self.rule(rule_id)?;
        if rule.is_catastrophic() {
            return Ok(OutcomeApplied::Ignored);
        }
        let Some(circuit) = state.circuits.get_mut(rule_id) else {
            return Ok(OutcomeApplied::Ignored);
        };
        let applied = circuit.report_outcome(&rule.cooldown_schedule, target, succeeded, now_ms);
        match applied {
            OutcomeApplied::Closed => {
                state.windows.clear(rule_id);
                info!(rule_id, subject = target, "probe succeeded; circuit closed");
            }
            OutcomeApplied::Reopened { retry_after_ms } => {
                info!(rule_id, subject = target, retry_after_ms, "probe failed; circuit reopened");
            }
            OutcomeApplied::Ignored => {
                debug!(rule_id, subject = target, "no probe in flight; outcome ignored");
            }
        }
        Ok(applied)
    }

    /// Record an explicit override of `rule_id` for `target`.
    ///
    /// Threshold rules: breaker forced Closed, backoff reset, window cleared.
    /// Catastrophic rules: a grant for `(rule_id, target)`, scoped to `session_id`
    /// when one is given.
    pub fn record_override(
        &self,
        state: &mut PolicyState,
        rule_id: &str,
        target: &str,
        reason_tag: &str,
        session_id: Option<&str>,
        now_ms: u64,
    ) -> Result<(), AdminError> {
        let rule = self.rule(rule_id)?;
        self.apply_override(state, rule, target, reason_tag, session_id, true, now_ms);
        Ok(())
    }

    /// Manually record a false positive. Feeds the tuner exactly like an override;
    /// without a target no catastrophic grant is created.
    pub fn force_false_positive(
        &self,
        state: &mut PolicyState,
        rule_id: &str,
        target: Option<&str>,
        reason_tag: &str,
        now_ms: u64,
    ) -> Result<(), AdminError> {
        let rule = self.rule(rule_id)?;
        let grant = target.is_some();
        let target = target.unwrap_or(UNSPECIFIED_TARGET);
        self.apply_override(state, rule, target, reason_tag, None, grant, now_ms);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_override(
        &self,
        state: &mut PolicyState,
        rule: &RuleDefinition,
        target: &str,
        reason_tag: &str,
        session_id: Option<&str>,
        grant: bool,
        now_ms: u64,
    ) {
        state.overrides.append(OverrideEvent {
            rule_id: rule.id.clone(),
            target: target.to_string(),
            timestamp_ms: now_ms,
            reason_tag: reason_tag.to_string(),
            session_id: session_id.map(str::to_string),
        });
        state.tuner.entry(rule).record_override();
        match rule.category {
            RuleCategory::Threshold => {
                state.circuits.entry(&rule.id).force_close();
                state.windows.clear(&rule.id);
            }
            RuleCategory::Catastrophic => {
                if grant {
                    state.overrides.grant(&rule.id, target, session_id, now_ms);
                }
            }
        }
        info!(
            rule_id = %rule.id,
            subject = target,
            reason = reason_tag,
            session = session_id.unwrap_or("*"),
            "override recorded"
        );
    }

    /// Manually set a Threshold rule's threshold, clamped to its range.
    /// Returns the value actually applied.
    pub fn set_threshold(
        &self,
        state: &mut PolicyState,
        rule_id: &str,
        value: f64,
        now_ms: u64,
    ) -> Result<f64, AdminError> {
        let rule = self.rule(rule_id)?;
        if rule.is_catastrophic() {
            return Err(AdminError::NotTunable {
                id: rule_id.to_string(),
            });
        }
        if !value.is_finite() {
            return Err(AdminError::InvalidThreshold { value });
        }
        let applied = rule.tunable_range.clamp(round_threshold(value));
        let tuner = state.tuner.entry(rule);
        let adjustment = TuningAdjustment {
            rule_id: rule.id.clone(),
            from: tuner.threshold,
            to: applied,
            fp_rate: tuner.false_positive_rate(),
            detections: tuner.total_detections,
            overrides: tuner.total_overrides,
            at_ms: now_ms,
            source: AdjustmentSource::Manual,
        };
        tuner.threshold = applied;
        state.push_history(&[adjustment], self.tuning_history_max);
        info!(rule_id, requested = value, applied, "threshold set manually");
        Ok(applied)
    }

    /// Clear circuit, window, tuner, and grant state for one rule.
    pub fn reset_rule(&self, state: &mut PolicyState, rule_id: &str) -> Result<(), AdminError> {
        self.rule(rule_id)?;
        state.clear_rule(rule_id);
        info!(rule_id, "rule state reset");
        Ok(())
    }

    pub fn reset_all(&self, state: &mut PolicyState) {
        state.clear_all_rules();
        info!("all rule state reset");
    }

    /// One tuning pass over every Threshold rule.
    pub fn run_tuner(&self, state: &mut PolicyState, now_ms: u64) -> Vec<TuningAdjustment> {
        let adjustments = state.tuner.tune(&self.catalog, &self.tuner, now_ms);
        state.last_tuning_ms = Some(now_ms);
        for adjustment in &adjustments {
            info!(
                rule_id = %adjustment.rule_id,
                from = adjustment.from,
                to = adjustment.to,
                fp_rate = adjustment.fp_rate,
                "threshold tuned"
            );
        }
        state.push_history(&adjustments, self.tuning_history_max);
        adjustments
    }

    /// Retention sweep over override events and catastrophic grants. Never called
    /// by `handle`.
    pub fn prune_overrides(
        &self,
        state: &mut PolicyState,
        now_ms: u64,
        policy: RetentionPolicy,
    ) -> PruneSummary {
        let removed = state.overrides.prune(now_ms, policy);
        if removed != PruneSummary::default() {
            info!(
                events = removed.events,
                grants = removed.grants,
                "override retention sweep"
            );
        }
        removed
    }

    pub fn report(&self, state: &PolicyState, now_ms: u64) -> Vec<RuleReport> {
        let tick = Tick::new(now_ms, state.turn_count);
        self.catalog
            .iter()
            .map(|rule| {
                let tuner = state.tuner.get(&rule.id);
                let circuit = state.circuits.get(&rule.id).cloned().unwrap_or_default();
                let window_count = state
                    .windows
                    .get(&rule.id)
                    .map(|window| window.clone().count_in_window(rule.window, tick))
                    .unwrap_or(0);
                RuleReport {
                    rule_id: rule.id.clone(),
                    category: rule.category,
                    description: rule.description.clone(),
                    threshold: state.tuner.threshold_for(rule),
                    range_min: rule.tunable_range.min,
                    range_max: rule.tunable_range.max,
                    window: rule.window.describe(),
                    phase: circuit.phase,
                    attempt_index: circuit.attempt_index,
                    retry_after_seconds: circuit.remaining_ms(now_ms).map(ms_to_retry_secs),
                    window_count,
                    detections: tuner.map(|t| t.total_detections).unwrap_or(0),
                    overrides: tuner.map(|t| t.total_overrides).unwrap_or(0),
                    false_positive_rate: tuner.map(|t| t.false_positive_rate()).unwrap_or(0.0),
                    lifetime_detections: tuner.map(|t| t.lifetime_detections).unwrap_or(0),
                    lifetime_overrides: tuner.map(|t| t.lifetime_overrides).unwrap_or(0),
                    last_tuned_at_ms: tuner.and_then(|t| t.last_tuned_at_ms),
                    trips_total: circuit.trips_total,
                    grants: state.overrides.grants_for(&rule.id),
                }
            })
            .collect()
    }

    fn rule(&self, rule_id: &str) -> Result<&RuleDefinition, AdminError> {
        self.catalog
            .get(rule_id)
            .ok_or_else(|| AdminError::UnknownRule {
                id: rule_id.to_string(),
            })
    }
}

fn compose_decision(verdicts: &[(&RuleDefinition, Verdict)], target: &str) -> GateDecision {
    let denial = verdicts.iter().find_map(|(rule, verdict)| match *verdict {
        Verdict::Deny {
            count,
            threshold,
            retry_after_ms,
        } => Some((*rule, count, threshold, retry_after_ms)),
        _ => None,
    });
    if let Some((rule, count, threshold, retry_after_ms)) = denial {
        let message = match retry_after_ms {
            None => format!(
                "Blocked by {id} ({desc}) on '{target}': catastrophic rule, {count} of threshold {threshold}. \
                 It does not expire; an explicit override is required.",
                id = rule.id,
                desc = rule.description,
            ),
            Some(ms) => format!(
                "Blocked by {id} ({desc}) on '{target}': {count} in the {window}, threshold {threshold}. \
                 Cooling down; retry in {secs}s.",
                id = rule.id,
                desc = rule.description,
                window = rule.window.describe(),
                secs = ms_to_retry_secs(ms),
            ),
        };
        return GateDecision::deny(&rule.id, message, retry_after_ms);
    }

    if let Some((rule, _)) = verdicts
        .iter()
        .find(|(_, verdict)| matches!(verdict, Verdict::Probe))
    {
        return GateDecision::probe(
            &rule.id,
            format!(
                "Allowed as a probe for {id} after its cooldown; report the outcome to close the circuit.",
                id = rule.id
            ),
        );
    }

    let notes: Vec<String> = verdicts
        .iter()
        .filter_map(|(rule, verdict)| match verdict {
            Verdict::Allow { count, threshold } if !rule.is_catastrophic() => {
                Some(format!("{} {count}/{threshold}", rule.id))
            }
            Verdict::Allow { .. } => Some(format!("{} (override on record)", rule.id)),
            Verdict::ProbeDue => Some(format!("{} cooldown elapsed, probe pending", rule.id)),
            _ => None,
        })
        .collect();
    if notes.is_empty() {
        GateDecision::allow("allowed")
    } else {
        GateDecision::allow(format!("allowed; {}", notes.join(", ")))
    }
}
