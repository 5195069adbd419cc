//! Event classifier: raw event → violation candidates.
//!
//! Evaluation order is fixed: every Catastrophic rule runs first, in catalog order.
//! If any of them fires, Threshold rules are skipped for the event, so the caller
//! always sees the catastrophic violation first.
//!
//! A predicate that panics is contained: that rule is skipped for this event, the
//! remaining rules still run, and the fault is returned for telemetry.

use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

use super::catalog::RuleCatalog;
use super::definition::{RuleCategory, RuleDefinition, Violation};
use crate::gate::GateEvent;

/// A rule whose predicate panicked while evaluating an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationFault {
    pub rule_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub violations: Vec<Violation>,
    pub faults: Vec<ClassificationFault>,
}

impl Classification {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn has_catastrophic(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.category == RuleCategory::Catastrophic)
    }
}

/// Classify one event against the catalog. Deterministic for a given
/// `(event, catalog, now_ms)`.
pub fn classify(event: &GateEvent, catalog: &RuleCatalog, now_ms: u64) -> Classification {
    let mut out = Classification::default();

    run_rules(
        event,
        catalog.by_category(RuleCategory::Catastrophic),
        now_ms,
        &mut out,
    );
    if out.has_catastrophic() {
        return out;
    }
    run_rules(
        event,
        catalog.by_category(RuleCategory::Threshold),
        now_ms,
        &mut out,
    );
    out
}

fn run_rules<'a>(
    event: &GateEvent,
    rules: impl Iterator<Item = &'a RuleDefinition>,
    now_ms: u64,
    out: &mut Classification,
) {
    for rule in rules {
        if rule.is_excluded(&event.target) {
            continue;
        }
        let predicate = rule.predicate;
        match panic::catch_unwind(AssertUnwindSafe(|| predicate(event))) {
            Ok(true) => out.violations.push(Violation {
                rule_id: rule.id.clone(),
                category: rule.category,
                target: event.target.clone(),
                timestamp_ms: now_ms,
                severity: rule.category.severity(),
            }),
            Ok(false) => {}
            Err(payload) => out.faults.push(ClassificationFault {
                rule_id: rule.id.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "rule predicate panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::definition::{TunableRange, WindowSpec};

    fn always(_: &GateEvent) -> bool {
        true
    }

    fn never(_: &GateEvent) -> bool {
        false
    }

    fn explodes(_: &GateEvent) -> bool {
        panic!("predicate blew up")
    }

    fn soft(id: &str, predicate: fn(&GateEvent) -> bool) -> RuleDefinition {
        RuleDefinition::threshold(
            id,
            "soft rule",
            predicate,
            WindowSpec::Events(10),
            3.0,
            TunableRange::new(1.0, 5.0),
        )
    }

    #[test]
    fn test_clean_event_yields_no_violations() {
        let catalog = RuleCatalog::builtin().expect("catalog");
        let event = GateEvent::new("Write", "src/parser.rs");
        let result = classify(&event, &catalog, 1_000);
        assert!(result.is_clean());
        assert!(result.faults.is_empty());
    }

    #[test]
    fn test_catastrophic_short_circuits_threshold_rules() {
        // GIVEN: a catastrophic rule listed after a threshold rule, both firing
        let catalog = RuleCatalog::new(vec![
            soft("soft-a", always),
            RuleDefinition::catastrophic("hard", "hard rule", always),
        ])
        .expect("catalog");

        // WHEN: classifying
        let result = classify(&GateEvent::new("Write", "x"), &catalog, 5);

        // THEN: only the catastrophic violation is produced
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].rule_id, "hard");
        assert_eq!(result.violations[0].timestamp_ms, 5);
    }

    #[test]
    fn test_one_event_can_trip_several_threshold_rules() {
        let catalog = RuleCatalog::builtin().expect("catalog");
        let event = GateEvent::new("Write", "src/hooks/debug_probe.py");
        let result = classify(&event, &catalog, 0);
        let ids: Vec<&str> = result
            .violations
            .iter()
            .map(|v| v.rule_id.as_str())
            .collect();
        assert_eq!(ids, vec!["hook-explosion", "production-pollution"]);
    }

    #[test]
    fn test_excluded_target_bypasses_rule() {
        let catalog = RuleCatalog::builtin().expect("catalog");
        let result = classify(&GateEvent::new("Write", "README.md"), &catalog, 0);
        assert!(result.is_clean());
    }

    #[test]
    fn test_panicking_predicate_is_skipped_and_reported() {
        // GIVEN: a rule whose predicate panics alongside a healthy rule
        let catalog = RuleCatalog::new(vec![soft("broken", explodes), soft("healthy", always)])
            .expect("catalog");

        // WHEN: classifying
        let result = classify(&GateEvent::new("Write", "x"), &catalog, 0);

        // THEN: the healthy rule still fires and the fault is surfaced
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].rule_id, "healthy");
        assert_eq!(
            result.faults,
            vec![ClassificationFault {
                rule_id: "broken".to_string(),
                message: "predicate blew up".to_string(),
            }]
        );
    }

    #[test]
    fn test_no_rules_fire_when_predicates_decline() {
        let catalog = RuleCatalog::new(vec![soft("quiet", never)]).expect("catalog");
        assert!(classify(&GateEvent::new("Bash", "ls"), &catalog, 0).is_clean());
    }
}
