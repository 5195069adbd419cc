//! Per-rule circuit breaker with exponential-backoff cooldowns.
//!
//! Stops runaway repetition of a Threshold rule:
//!
//! ```text
//!   Closed ──(window count >= threshold)──> Open      (cooldown = schedule[attempt])
//!   Open ──(now >= next_probe_at)─────────> HalfOpen  (one probe allowed)
//!   HalfOpen ──(probe succeeded)──────────> Closed    (attempt reset to 0)
//!   HalfOpen ──(probe re-violated)────────> Open      (next, never shorter, cooldown)
//! ```
//!
//! The attempt index is capped at the last schedule step, so once the schedule is
//! exhausted the final (largest) cooldown repeats.
//!
//! Catastrophic rules do not use this breaker; they block until overridden.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rules::CooldownSchedule;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::Open => "open",
            CircuitPhase::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// The single HalfOpen probe; the host must report its outcome.
    Probe,
    Deny {
        retry_after_ms: u64,
        /// True when this evaluation tripped the breaker (as opposed to hitting an
        /// already-open breaker).
        tripped: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeApplied {
    Closed,
    Reopened { retry_after_ms: u64 },
    /// No probe in flight for this rule/target; nothing changed.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub attempt_index: u32,
    pub opened_at_ms: Option<u64>,
    pub next_probe_at_ms: Option<u64>,
    /// Target of the outstanding HalfOpen probe.
    pub probe_target: Option<String>,
    /// Cooldown applied by the most recent trip.
    pub last_cooldown_ms: Option<u64>,
    pub trips_total: u64,
}

/// What a violation would do to the breaker, before anything is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAssessment {
    Allow,
    /// Closed at threshold, or a second violation while a probe is outstanding.
    Trip,
    Cooling { retry_after_ms: u64 },
    /// Cooldown elapsed; the violating action may run as the probe.
    ProbeDue,
}

impl CircuitState {
    /// Classify one violation against the breaker without changing it.
    pub fn assess(&self, window_count: usize, threshold: f64, now_ms: u64) -> BreakerAssessment {
        match self.phase {
            CircuitPhase::Closed if window_count as f64 >= threshold => BreakerAssessment::Trip,
            CircuitPhase::Closed => BreakerAssessment::Allow,
            CircuitPhase::Open => {
                let next_probe_at = self.next_probe_at_ms.unwrap_or(now_ms);
                if now_ms >= next_probe_at {
                    BreakerAssessment::ProbeDue
                } else {
                    BreakerAssessment::Cooling {
                        retry_after_ms: next_probe_at - now_ms,
                    }
                }
            }
            // The probe re-triggered the rule before its outcome arrived.
            CircuitPhase::HalfOpen if self.probe_target.is_some() => BreakerAssessment::Trip,
            CircuitPhase::HalfOpen => BreakerAssessment::ProbeDue,
        }
    }

    /// Evaluate one violation and commit the transition.
    pub fn evaluate(
        &mut self,
        schedule: &CooldownSchedule,
        window_count: usize,
        threshold: f64,
        target: &str,
        now_ms: u64,
    ) -> BreakerDecision {
        match self.assess(window_count, threshold, now_ms) {
            BreakerAssessment::Allow => BreakerDecision::Allow,
            BreakerAssessment::Trip => BreakerDecision::Deny {
                retry_after_ms: self.trip(schedule, now_ms),
                tripped: true,
            },
            BreakerAssessment::Cooling { retry_after_ms } => BreakerDecision::Deny {
                retry_after_ms,
                tripped: false,
            },
            BreakerAssessment::ProbeDue => {
                self.grant_probe(target);
                BreakerDecision::Probe
            }
        }
    }

    /// Move to HalfOpen with `target` as the outstanding probe.
    pub fn grant_probe(&mut self, target: &str) {
        self.phase = CircuitPhase::HalfOpen;
        self.probe_target = Some(target.to_string());
    }

    /// Apply the host's report on the HalfOpen probe.
    pub fn report_outcome(
        &mut self,
        schedule: &CooldownSchedule,
        target: &str,
        succeeded: bool,
        now_ms: u64,
    ) -> OutcomeApplied {
        if self.phase != CircuitPhase::HalfOpen || self.probe_target.as_deref() != Some(target) {
            return OutcomeApplied::Ignored;
        }
        if succeeded {
            self.force_close();
            OutcomeApplied::Closed
        } else {
            let retry_after_ms = self.trip(schedule, now_ms);
            OutcomeApplied::Reopened { retry_after_ms }
        }
    }

    /// Close unconditionally and forget the backoff position.
    pub fn force_close(&mut self) {
        self.phase = CircuitPhase::Closed;
        self.attempt_index = 0;
        self.opened_at_ms = None;
        self.next_probe_at_ms = None;
        self.probe_target = None;
    }

    /// Remaining cooldown while Open, in milliseconds.
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        match (self.phase, self.next_probe_at_ms) {
            (CircuitPhase::Open, Some(next)) => Some(next.saturating_sub(now_ms)),
            _ => None,
        }
    }

    /// Open with the cooldown at the current attempt index, then advance the index.
    /// Returns the cooldown applied.
    pub fn trip(&mut self, schedule: &CooldownSchedule, now_ms: u64) -> u64 {
        let cooldown_ms = schedule.delay_for_attempt(self.attempt_index).as_millis() as u64;
        self.phase = CircuitPhase::Open;
        self.opened_at_ms = Some(now_ms);
        self.next_probe_at_ms = Some(now_ms.saturating_add(cooldown_ms));
        self.probe_target = None;
        self.attempt_index = self
            .attempt_index
            .saturating_add(1)
            .min(schedule.last_index());
        self.last_cooldown_ms = Some(cooldown_ms);
        self.trips_total += 1;
        cooldown_ms
    }
}

/// Circuit state per rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakerBoard {
    circuits: BTreeMap<String, CircuitState>,
}

impl BreakerBoard {
    pub fn entry(&mut self, rule_id: &str) -> &mut CircuitState {
        self.circuits.entry(rule_id.to_string()).or_default()
    }

    pub fn get(&self, rule_id: &str) -> Option<&CircuitState> {
        self.circuits.get(rule_id)
    }

    pub fn get_mut(&mut self, rule_id: &str) -> Option<&mut CircuitState> {
        self.circuits.get_mut(rule_id)
    }

    pub fn remove(&mut self, rule_id: &str) {
        self.circuits.remove(rule_id);
    }

    pub fn clear_all(&mut self) {
        self.circuits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 3.0;

    fn tripped_breaker(schedule: &CooldownSchedule, now_ms: u64) -> CircuitState {
        let mut breaker = CircuitState::default();
        let decision = breaker.evaluate(schedule, 3, THRESHOLD, "t", now_ms);
        assert!(matches!(decision, BreakerDecision::Deny { tripped: true, .. }));
        breaker
    }

    #[test]
    fn test_breaker_allows_below_threshold() {
        // GIVEN: a closed breaker
        let mut breaker = CircuitState::default();
        let schedule = CooldownSchedule::standard();

        // WHEN: the window count is below threshold
        let decision = breaker.evaluate(&schedule, 2, THRESHOLD, "t", 0);

        // THEN: allowed and still closed
        assert_eq!(decision, BreakerDecision::Allow);
        assert_eq!(breaker.phase, CircuitPhase::Closed);
    }

    #[test]
    fn test_breaker_trips_at_threshold_with_first_cooldown() {
        let schedule = CooldownSchedule::standard();
        let breaker = tripped_breaker(&schedule, 1_000);

        assert_eq!(breaker.phase, CircuitPhase::Open);
        assert_eq!(breaker.opened_at_ms, Some(1_000));
        assert_eq!(breaker.next_probe_at_ms, Some(6_000));
        assert_eq!(breaker.attempt_index, 1);
        assert_eq!(breaker.trips_total, 1);
    }

    #[test]
    fn test_open_breaker_reports_remaining_cooldown_without_restart() {
        // GIVEN: a breaker tripped at t=0 with a 5s cooldown
        let schedule = CooldownSchedule::standard();
        let mut breaker = tripped_breaker(&schedule, 0);

        // WHEN: violations arrive during the cooldown
        let at_2s = breaker.evaluate(&schedule, 4, THRESHOLD, "t", 2_000);
        let at_4s = breaker.evaluate(&schedule, 5, THRESHOLD, "t", 4_000);

        // THEN: the remaining time counts down; the cooldown does not restart
        assert_eq!(
            at_2s,
            BreakerDecision::Deny {
                retry_after_ms: 3_000,
                tripped: false
            }
        );
        assert_eq!(
            at_4s,
            BreakerDecision::Deny {
                retry_after_ms: 1_000,
                tripped: false
            }
        );
        assert_eq!(breaker.next_probe_at_ms, Some(5_000));
    }

    #[test]
    fn test_cooldown_elapsed_allows_single_probe() {
        let schedule = CooldownSchedule::standard();
        let mut breaker = tripped_breaker(&schedule, 0);

        let probe = breaker.evaluate(&schedule, 4, THRESHOLD, "probe", 5_000);
        assert_eq!(probe, BreakerDecision::Probe);
        assert_eq!(breaker.phase, CircuitPhase::HalfOpen);
        assert_eq!(breaker.probe_target.as_deref(), Some("probe"));

        // A second violation before the outcome re-opens with the next cooldown.
        let second = breaker.evaluate(&schedule, 5, THRESHOLD, "other", 5_100);
        assert_eq!(
            second,
            BreakerDecision::Deny {
                retry_after_ms: 10_000,
                tripped: true
            }
        );
        assert_eq!(breaker.phase, CircuitPhase::Open);
    }

    #[test]
    fn test_successful_probe_closes_and_resets_attempts() {
        let schedule = CooldownSchedule::standard();
        let mut breaker = tripped_breaker(&schedule, 0);
        breaker.evaluate(&schedule, 4, THRESHOLD, "probe", 5_000);

        let applied = breaker.report_outcome(&schedule, "probe", true, 5_500);

        assert_eq!(applied, OutcomeApplied::Closed);
        assert_eq!(breaker.phase, CircuitPhase::Closed);
        assert_eq!(breaker.attempt_index, 0);
        assert_eq!(breaker.next_probe_at_ms, None);
    }

    #[test]
    fn test_failed_probe_reopens_with_longer_cooldown() {
        let schedule = CooldownSchedule::standard();
        let mut breaker = tripped_breaker(&schedule, 0);
        breaker.evaluate(&schedule, 4, THRESHOLD, "probe", 5_000);

        let applied = breaker.report_outcome(&schedule, "probe", false, 5_000);

        assert_eq!(
            applied,
            OutcomeApplied::Reopened {
                retry_after_ms: 10_000
            }
        );
        assert_eq!(breaker.attempt_index, 2);
    }

    #[test]
    fn test_outcome_for_other_target_is_ignored() {
        let schedule = CooldownSchedule::standard();
        let mut breaker = tripped_breaker(&schedule, 0);
        breaker.evaluate(&schedule, 4, THRESHOLD, "probe", 5_000);

        let applied = breaker.report_outcome(&schedule, "someone-else", true, 5_000);

        assert_eq!(applied, OutcomeApplied::Ignored);
        assert_eq!(breaker.phase, CircuitPhase::HalfOpen);
    }

    #[test]
    fn test_backoff_repeats_final_step_after_schedule_exhausted() {
        // GIVEN: a breaker repeatedly failing its probe
        let schedule = CooldownSchedule::standard();
        let mut breaker = CircuitState::default();
        let mut now = 0;
        let mut applied = Vec::new();

        let first = breaker.evaluate(&schedule, 3, THRESHOLD, "t", now);
        if let BreakerDecision::Deny { retry_after_ms, .. } = first {
            applied.push(retry_after_ms);
            now += retry_after_ms;
        }

        // WHEN: probing and failing 6 more times
        for _ in 0..6 {
            assert_eq!(
                breaker.evaluate(&schedule, 3, THRESHOLD, "t", now),
                BreakerDecision::Probe
            );
            match breaker.report_outcome(&schedule, "t", false, now) {
                OutcomeApplied::Reopened { retry_after_ms } => {
                    applied.push(retry_after_ms);
                    now += retry_after_ms;
                }
                other => panic!("expected reopen, got {:?}", other),
            }
        }

        // THEN: cooldowns follow the schedule, then hold at the final step
        assert_eq!(
            applied,
            vec![5_000, 10_000, 30_000, 60_000, 300_000, 300_000, 300_000]
        );
        assert_eq!(breaker.attempt_index, schedule.last_index());
    }

    #[test]
    fn test_assess_leaves_due_breaker_open() {
        // GIVEN: a breaker whose cooldown has elapsed
        let schedule = CooldownSchedule::standard();
        let breaker = tripped_breaker(&schedule, 0);

        // WHEN: a violation is only assessed
        let assessment = breaker.assess(4, THRESHOLD, 5_000);

        // THEN: due, yet the breaker stays Open with no outstanding target
        assert_eq!(assessment, BreakerAssessment::ProbeDue);
        assert_eq!(breaker.phase, CircuitPhase::Open);
        assert_eq!(breaker.probe_target, None);
        assert_eq!(breaker.remaining_ms(5_000), Some(0));
    }

    #[test]
    fn test_force_close_from_open() {
        let schedule = CooldownSchedule::standard();
        let mut breaker = tripped_breaker(&schedule, 0);

        breaker.force_close();

        assert_eq!(breaker.phase, CircuitPhase::Closed);
        assert_eq!(breaker.attempt_index, 0);
        assert_eq!(breaker.remaining_ms(1), None);
    }
}
