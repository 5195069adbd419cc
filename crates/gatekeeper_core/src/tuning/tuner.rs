//! Auto-tuner: recalibrates Threshold rules from observed false-positive rate.
//!
//! Per rule, once per pass:
//! - fp_rate > loosen_fp_rate → threshold *= loosen_factor (capped at range max)
//! - fp_rate < tighten_fp_rate and detections > tighten_min_detections
//!   → threshold *= tighten_factor (floored at range min)
//! - otherwise unchanged (converged)
//!
//! Counters reset after every pass so the rate is windowed per pass, not cumulative.
//! Catastrophic rules are never tuned.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rules::{RuleCatalog, RuleCategory, RuleDefinition, TunableRange};

/// Defaults for the tuner knobs.
pub const LOOSEN_FP_RATE_DEFAULT: f64 = 0.15;
pub const TIGHTEN_FP_RATE_DEFAULT: f64 = 0.05;
pub const TIGHTEN_MIN_DETECTIONS_DEFAULT: u64 = 50;
pub const LOOSEN_FACTOR_DEFAULT: f64 = 1.20;
pub const TIGHTEN_FACTOR_DEFAULT: f64 = 0.90;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerConfig {
    pub loosen_fp_rate: f64,
    pub tighten_fp_rate: f64,
    pub tighten_min_detections: u64,
    pub loosen_factor: f64,
    pub tighten_factor: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            loosen_fp_rate: LOOSEN_FP_RATE_DEFAULT,
            tighten_fp_rate: TIGHTEN_FP_RATE_DEFAULT,
            tighten_min_detections: TIGHTEN_MIN_DETECTIONS_DEFAULT,
            loosen_factor: LOOSEN_FACTOR_DEFAULT,
            tighten_factor: TIGHTEN_FACTOR_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerState {
    pub threshold: f64,
    pub total_detections: u64,
    pub total_overrides: u64,
    pub last_tuned_at_ms: Option<u64>,
    #[serde(default)]
    pub lifetime_detections: u64,
    #[serde(default)]
    pub lifetime_overrides: u64,
}

impl TunerState {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            total_detections: 0,
            total_overrides: 0,
            last_tuned_at_ms: None,
            lifetime_detections: 0,
            lifetime_overrides: 0,
        }
    }

    pub fn record_detection(&mut self) {
        self.total_detections += 1;
        self.lifetime_detections += 1;
    }

    pub fn record_override(&mut self) {
        self.total_overrides += 1;
        self.lifetime_overrides += 1;
    }

    /// `total_overrides / max(total_detections, 1)`.
    pub fn false_positive_rate(&self) -> f64 {
        self.total_overrides as f64 / self.total_detections.max(1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentSource {
    AutoTuner,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningAdjustment {
    pub rule_id: String,
    pub from: f64,
    pub to: f64,
    pub fp_rate: f64,
    pub detections: u64,
    pub overrides: u64,
    pub at_ms: u64,
    pub source: AdjustmentSource,
}

/// Thresholds are kept at two decimals so repeated scaling stays readable and
/// comparisons against integer counts stay exact.
pub fn round_threshold(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One tuning step for one rule. Returns the new threshold when it changed.
pub fn tune_rule(
    state: &mut TunerState,
    range: TunableRange,
    config: &TunerConfig,
    now_ms: u64,
) -> Option<f64> {
    let fp_rate = state.false_positive_rate();
    let current = state.threshold;
    let proposed = if fp_rate > config.loosen_fp_rate {
        Some(range.clamp(round_threshold(current * config.loosen_factor)))
    } else if fp_rate < config.tighten_fp_rate
        && state.total_detections > config.tighten_min_detections
    {
        Some(range.clamp(round_threshold(current * config.tighten_factor)))
    } else {
        None
    };

    state.total_detections = 0;
    state.total_overrides = 0;
    state.last_tuned_at_ms = Some(now_ms);

    match proposed {
        Some(next) if next != current => {
            state.threshold = next;
            Some(next)
        }
        _ => {
            // Re-clamp in case the range was narrowed by configuration.
            state.threshold = range.clamp(current);
            None
        }
    }
}

/// Tuner counters and thresholds per rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunerBook {
    rules: BTreeMap<String, TunerState>,
}

impl TunerBook {
    pub fn entry(&mut self, rule: &RuleDefinition) -> &mut TunerState {
        self.rules
            .entry(rule.id.clone())
            .or_insert_with(|| TunerState::new(rule.base_threshold))
    }

    pub fn get(&self, rule_id: &str) -> Option<&TunerState> {
        self.rules.get(rule_id)
    }

    /// Current threshold, bounded by the rule's range.
    pub fn threshold_for(&self, rule: &RuleDefinition) -> f64 {
        match rule.category {
            RuleCategory::Catastrophic => 1.0,
            RuleCategory::Threshold => rule.tunable_range.clamp(
                self.rules
                    .get(&rule.id)
                    .map(|state| state.threshold)
                    .unwrap_or(rule.base_threshold),
            ),
        }
    }

    pub fn remove(&mut self, rule_id: &str) {
        self.rules.remove(rule_id);
    }

    pub fn clear_all(&mut self) {
        self.rules.clear();
    }

    /// Run one tuning pass over every Threshold rule that has state.
    pub fn tune(
        &mut self,
        catalog: &RuleCatalog,
        config: &TunerConfig,
        now_ms: u64,
    ) -> Vec<TuningAdjustment> {
        let mut adjustments = Vec::new();
        for rule in catalog.by_category(RuleCategory::Threshold) {
            let Some(state) = self.rules.get_mut(&rule.id) else {
                continue;
            };
            let from = state.threshold;
            let fp_rate = state.false_positive_rate();
            let detections = state.total_detections;
            let overrides = state.total_overrides;
            if let Some(to) = tune_rule(state, rule.tunable_range, config, now_ms) {
                adjustments.push(TuningAdjustment {
                    rule_id: rule.id.clone(),
                    from,
                    to,
                    fp_rate,
                    detections,
                    overrides,
                    at_ms: now_ms,
                    source: AdjustmentSource::AutoTuner,
                });
            }
        }
        adjustments
    }
}
