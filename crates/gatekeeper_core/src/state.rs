//! Durable policy state: everything the gate carries from one invocation to the next.
//!
//! One document per policy domain. Per-rule entries are created lazily on a rule's
//! first violation and never destroyed; they decay as windows empty and circuits close.

use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerBoard, WindowTracker};
use crate::ledger::OverrideLedger;
use crate::tuning::{TunerBook, TuningAdjustment};

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    pub schema_version: u32,
    /// Processed events since the state was created. Drives event-bounded windows
    /// and the tuning cadence.
    pub turn_count: u64,
    pub last_tuning_ms: Option<u64>,
    #[serde(default)]
    pub tuner: TunerBook,
    #[serde(default)]
    pub circuits: BreakerBoard,
    #[serde(default)]
    pub windows: WindowTracker,
    #[serde(default)]
    pub overrides: OverrideLedger,
    #[serde(default)]
    pub tuning_history: Vec<TuningAdjustment>,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            turn_count: 0,
            last_tuning_ms: None,
            tuner: TunerBook::default(),
            circuits: BreakerBoard::default(),
            windows: WindowTracker::default(),
            overrides: OverrideLedger::default(),
            tuning_history: Vec::new(),
        }
    }
}

impl PolicyState {
    /// Append to the tuning history, keeping only the newest `limit` entries.
    pub fn push_history(&mut self, adjustments: &[TuningAdjustment], limit: usize) {
        self.tuning_history.extend_from_slice(adjustments);
        if self.tuning_history.len() > limit {
            let excess = self.tuning_history.len() - limit;
            self.tuning_history.drain(..excess);
        }
    }

    /// Forget circuit, window, tuner, and grant state for one rule.
    /// Override events and bookkeeping counters are kept.
    pub fn clear_rule(&mut self, rule_id: &str) {
        self.tuner.remove(rule_id);
        self.circuits.remove(rule_id);
        self.windows.remove(rule_id);
        self.overrides.revoke_grants(rule_id);
    }

    pub fn clear_all_rules(&mut self) {
        self.tuner.clear_all();
        self.circuits.clear_all();
        self.windows.clear_all();
        self.overrides.revoke_all_grants();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::AdjustmentSource;

    fn adjustment(at_ms: u64) -> TuningAdjustment {
        TuningAdjustment {
            rule_id: "r".to_string(),
            from: 1.0,
            to: 2.0,
            fp_rate: 0.2,
            detections: 10,
            overrides: 2,
            at_ms,
            source: AdjustmentSource::AutoTuner,
        }
    }

    #[test]
    fn test_history_keeps_newest_entries() {
        let mut state = PolicyState::default();
        state.push_history(&[adjustment(1), adjustment(2), adjustment(3)], 2);
        let kept: Vec<u64> = state.tuning_history.iter().map(|a| a.at_ms).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[test]
    fn test_minimal_document_deserializes_with_defaults() {
        let state: PolicyState =
            serde_json::from_str(r#"{"schema_version":1,"turn_count":7,"last_tuning_ms":null}"#)
                .expect("minimal document");
        assert_eq!(state.turn_count, 7);
        assert!(state.overrides.events().is_empty());
    }
}
