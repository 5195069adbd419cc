use gatekeeper_core::breaker::{CircuitPhase, OutcomeApplied};
use gatekeeper_core::{GateEvent, PolicyGate, PolicyState, RuleCatalog};

fn gate() -> PolicyGate {
    PolicyGate::new(RuleCatalog::builtin().expect("builtin catalog"))
}

fn root_write(session: &str) -> GateEvent {
    GateEvent::new("Write", "/x.py").with_session(session)
}

fn hook_write() -> GateEvent {
    GateEvent::new("Edit", ".claude/hooks/post_tool.sh").with_session("s1")
}

/// Drive hook-explosion up to and including its tripping occurrence at `now_ms`.
fn trip_hook_explosion(gate: &PolicyGate, state: &mut PolicyState, now_ms: u64) {
    for _ in 0..29 {
        assert!(gate.handle(&hook_write(), state, now_ms).decision.allowed);
    }
    let tripped = gate.handle(&hook_write(), state, now_ms).decision;
    assert!(!tripped.allowed);
}

/// Catastrophic root-pollution blocks until an explicit override for (rule, target).
#[test]
fn test_root_pollution_denies_until_overridden() {
    // GIVEN: an empty state
    let gate = gate();
    let mut state = PolicyState::default();

    // WHEN: the same unlisted root-level write arrives twice
    let first = gate.handle(&root_write("s1"), &mut state, 1_000).decision;
    let second = gate.handle(&root_write("s1"), &mut state, 2_000).decision;

    // THEN: both are denied by root-pollution with no retry hint
    for decision in [&first, &second] {
        assert!(!decision.allowed);
        assert_eq!(decision.rule_id.as_deref(), Some("root-pollution"));
        assert_eq!(decision.retry_after_seconds, None);
    }

    // WHEN: an override is recorded for that exact target
    gate.record_override(&mut state, "root-pollution", "/x.py", "manual", None, 3_000)
        .expect("known rule");
    let third = gate.handle(&root_write("s1"), &mut state, 4_000).decision;

    // THEN: the write is allowed
    assert!(third.allowed, "expected allow after override: {:?}", third);
}

/// Catastrophic rules never time out, however long the wait.
#[test]
fn test_catastrophic_rule_never_self_heals() {
    let gate = gate();
    let mut state = PolicyState::default();
    let day_ms = 86_400_000;

    for day in 0..10 {
        let decision = gate.handle(&root_write("s1"), &mut state, day * day_ms).decision;
        assert!(!decision.allowed, "day {day}: expected deny");
    }

    // An override for a different target does not cover /x.py.
    gate.record_override(&mut state, "root-pollution", "/y.py", "manual", None, 0)
        .expect("known rule");
    assert!(!gate.handle(&root_write("s1"), &mut state, 0).decision.allowed);
    assert_eq!(state.circuits.get("root-pollution"), None);
}

/// An in-band override is scoped to the session that supplied it.
#[test]
fn test_session_override_does_not_leak_to_other_sessions() {
    let gate = gate();
    let mut state = PolicyState::default();

    let overridden = gate
        .handle(&root_write("s1").with_override("SUDO"), &mut state, 0)
        .decision;
    assert!(overridden.allowed);

    assert!(gate.handle(&root_write("s1"), &mut state, 1).decision.allowed);
    assert!(!gate.handle(&root_write("s2"), &mut state, 2).decision.allowed);
}

/// hook-explosion trips on its 30th occurrence with the first cooldown step.
#[test]
fn test_hook_explosion_trips_at_threshold() {
    // GIVEN: 29 hook writes inside the window
    let gate = gate();
    let mut state = PolicyState::default();
    for n in 1..=29 {
        let decision = gate.handle(&hook_write(), &mut state, 0).decision;
        assert!(decision.allowed, "occurrence {n} should be allowed");
    }

    // WHEN: the 30th arrives
    let denied = gate.handle(&hook_write(), &mut state, 0).decision;

    // THEN: denied with the first cooldown step
    assert!(!denied.allowed);
    assert_eq!(denied.rule_id.as_deref(), Some("hook-explosion"));
    assert_eq!(denied.retry_after_seconds, Some(5));

    // AND: a further occurrence while Open reports the same, unrestarted cooldown
    let again = gate.handle(&hook_write(), &mut state, 0).decision;
    assert!(!again.allowed);
    assert_eq!(again.retry_after_seconds, Some(5));
    let later = gate.handle(&hook_write(), &mut state, 3_000).decision;
    assert_eq!(later.retry_after_seconds, Some(2));
}

/// After the cooldown, one probe is allowed; a successful outcome closes the circuit.
#[test]
fn test_probe_after_cooldown_closes_on_success() {
    // GIVEN: a tripped hook-explosion breaker
    let gate = gate();
    let mut state = PolicyState::default();
    trip_hook_explosion(&gate, &mut state, 0);

    // WHEN: the next occurrence arrives after the 5s cooldown
    let probe = gate.handle(&hook_write(), &mut state, 5_000).decision;

    // THEN: it is allowed as the probe and names the rule
    assert!(probe.allowed);
    assert_eq!(probe.rule_id.as_deref(), Some("hook-explosion"));
    let circuit = state.circuits.get("hook-explosion").expect("circuit");
    assert_eq!(circuit.phase, CircuitPhase::HalfOpen);

    // WHEN: the host reports the probe succeeded
    let applied = gate
        .report_outcome(&mut state, "hook-explosion", ".claude/hooks/post_tool.sh", true, 5_100)
        .expect("known rule");

    // THEN: closed, backoff reset, window cleared
    assert_eq!(applied, OutcomeApplied::Closed);
    let circuit = state.circuits.get("hook-explosion").expect("circuit");
    assert_eq!(circuit.phase, CircuitPhase::Closed);
    assert_eq!(circuit.attempt_index, 0);
    assert!(gate.handle(&hook_write(), &mut state, 5_200).decision.allowed);
}

/// A failed probe reopens with the next, longer cooldown.
#[test]
fn test_failed_probe_backs_off() {
    let gate = gate();
    let mut state = PolicyState::default();
    trip_hook_explosion(&gate, &mut state, 0);
    assert!(gate.handle(&hook_write(), &mut state, 5_000).decision.allowed);

    let applied = gate
        .report_outcome(&mut state, "hook-explosion", ".claude/hooks/post_tool.sh", false, 5_000)
        .expect("known rule");

    assert_eq!(
        applied,
        OutcomeApplied::Reopened {
            retry_after_ms: 10_000
        }
    );
    let denied = gate.handle(&hook_write(), &mut state, 6_000).decision;
    assert_eq!(denied.retry_after_seconds, Some(9));
}

/// 100 events with 20 overrides (20% FP) loosen hook-explosion from 30 to 36.
#[test]
fn test_tuner_loosens_noisy_rule() {
    // GIVEN: 20 recorded false positives for hook-explosion
    let gate = gate();
    let mut state = PolicyState::default();
    for _ in 0..20 {
        gate.force_false_positive(&mut state, "hook-explosion", None, "manual", 0)
            .expect("known rule");
    }

    // WHEN: the 100th processed event triggers a tuning pass
    let mut tuned = Vec::new();
    for _ in 0..100 {
        tuned.extend(gate.handle(&hook_write(), &mut state, 0).tuned);
    }

    // THEN: the threshold rises 30 → 36
    assert_eq!(tuned.len(), 1);
    assert_eq!(tuned[0].from, 30.0);
    assert_eq!(tuned[0].to, 36.0);
    let rule = gate.catalog().get("hook-explosion").expect("rule");
    assert_eq!(state.tuner.threshold_for(rule), 36.0);
    assert_eq!(state.tuning_history.len(), 1);
}

/// Overriding twice counts twice and leaves the breaker Closed each time.
#[test]
fn test_repeated_override_is_counted_not_deduplicated() {
    let gate = gate();
    let mut state = PolicyState::default();
    trip_hook_explosion(&gate, &mut state, 0);
    let before = state
        .tuner
        .get("hook-explosion")
        .map(|t| t.total_overrides)
        .unwrap_or(0);

    for _ in 0..2 {
        gate.record_override(&mut state, "hook-explosion", "x", "manual", None, 10)
            .expect("known rule");
        let circuit = state.circuits.get("hook-explosion").expect("circuit");
        assert_eq!(circuit.phase, CircuitPhase::Closed);
        assert_eq!(circuit.attempt_index, 0);
    }

    let after = state.tuner.get("hook-explosion").expect("tuner").total_overrides;
    assert_eq!(after - before, 2);
    assert_eq!(state.overrides.count_for("hook-explosion"), 2);
}

/// Reset clears rule state but keeps the catalog and the override history.
#[test]
fn test_reset_rule_clears_state() {
    let gate = gate();
    let mut state = PolicyState::default();
    trip_hook_explosion(&gate, &mut state, 0);
    gate.record_override(&mut state, "root-pollution", "/x.py", "manual", None, 0)
        .expect("known rule");

    gate.reset_rule(&mut state, "hook-explosion").expect("known rule");
    assert!(state.circuits.get("hook-explosion").is_none());
    assert!(gate.handle(&hook_write(), &mut state, 1).decision.allowed);

    gate.reset_all(&mut state);
    assert!(!gate.handle(&root_write("s1"), &mut state, 2).decision.allowed);
    assert_eq!(state.overrides.count_for("root-pollution"), 1);
    assert_eq!(gate.catalog().len(), 6);
}

fn debug_hook_write() -> GateEvent {
    GateEvent::new("Write", "src/hooks/debug_probe.py").with_session("s1")
}

fn phase(state: &PolicyState, rule_id: &str) -> CircuitPhase {
    state
        .circuits
        .get(rule_id)
        .map(|circuit| circuit.phase)
        .unwrap_or_default()
}

/// One action violating two rules whose cooldowns end together half-opens one rule at a time.
#[test]
fn test_shared_cooldown_half_opens_one_rule_per_event() {
    // GIVEN: a write that trips both hook-explosion and production-pollution at t=0
    let gate = gate();
    let mut state = PolicyState::default();
    for _ in 0..30 {
        gate.handle(&debug_hook_write(), &mut state, 0);
    }
    assert_eq!(phase(&state, "hook-explosion"), CircuitPhase::Open);
    assert_eq!(phase(&state, "production-pollution"), CircuitPhase::Open);

    // WHEN: the same write arrives once both 5s cooldowns have elapsed
    let first = gate.handle(&debug_hook_write(), &mut state, 5_000).decision;

    // THEN: only the first rule goes HalfOpen; the other breaker stays Open
    assert!(first.allowed);
    assert_eq!(first.rule_id.as_deref(), Some("hook-explosion"));
    assert_eq!(phase(&state, "hook-explosion"), CircuitPhase::HalfOpen);
    assert_eq!(phase(&state, "production-pollution"), CircuitPhase::Open);
    assert_eq!(
        state
            .circuits
            .get("production-pollution")
            .and_then(|circuit| circuit.probe_target.clone()),
        None
    );

    // WHEN: the trial write succeeds and is repeated
    let closed = gate
        .report_outcome(
            &mut state,
            "hook-explosion",
            "src/hooks/debug_probe.py",
            true,
            5_000,
        )
        .expect("known rule");
    assert_eq!(closed, OutcomeApplied::Closed);
    let second = gate.handle(&debug_hook_write(), &mut state, 5_000).decision;

    // THEN: the remaining rule gets its own trial, without extra backoff
    assert!(second.allowed);
    assert_eq!(second.rule_id.as_deref(), Some("production-pollution"));
    let pollution = state.circuits.get("production-pollution").expect("circuit");
    assert_eq!(pollution.phase, CircuitPhase::HalfOpen);
    assert_eq!(pollution.attempt_index, 1);
    assert_eq!(pollution.trips_total, 1);

    // WHEN: that trial succeeds too
    let closed = gate
        .report_outcome(
            &mut state,
            "production-pollution",
            "src/hooks/debug_probe.py",
            true,
            5_000,
        )
        .expect("known rule");

    // THEN: both breakers are Closed and the write flows again
    assert_eq!(closed, OutcomeApplied::Closed);
    assert_eq!(phase(&state, "production-pollution"), CircuitPhase::Closed);
    let third = gate.handle(&debug_hook_write(), &mut state, 5_000).decision;
    assert!(third.allowed);
    assert_eq!(third.rule_id, None);
}

/// A breaker whose cooldown elapsed stays Open while another rule denies the event.
#[test]
fn test_due_breaker_stays_open_while_event_denied() {
    // GIVEN: production-pollution tripped at t=0, hook-explosion tripped at t=3s
    let gate = gate();
    let mut state = PolicyState::default();
    for _ in 0..29 {
        gate.handle(&debug_hook_write(), &mut state, 0);
    }
    let tripped = gate.handle(&debug_hook_write(), &mut state, 3_000).decision;
    assert_eq!(tripped.rule_id.as_deref(), Some("hook-explosion"));

    // WHEN: production-pollution's cooldown has elapsed but hook-explosion's has not
    let denied = gate.handle(&debug_hook_write(), &mut state, 6_000).decision;

    // THEN: hook-explosion denies and production-pollution stays Open
    assert!(!denied.allowed);
    assert_eq!(denied.rule_id.as_deref(), Some("hook-explosion"));
    assert_eq!(denied.retry_after_seconds, Some(2));
    let pollution = state.circuits.get("production-pollution").expect("circuit");
    assert_eq!(pollution.phase, CircuitPhase::Open);
    assert_eq!(pollution.probe_target, None);
    assert_eq!(pollution.trips_total, 1);

    // WHEN: both cooldowns have elapsed
    let trial = gate.handle(&debug_hook_write(), &mut state, 8_000).decision;

    // THEN: exactly one rule goes HalfOpen
    assert!(trial.allowed);
    assert_eq!(trial.rule_id.as_deref(), Some("hook-explosion"));
    assert_eq!(phase(&state, "hook-explosion"), CircuitPhase::HalfOpen);
    assert_eq!(phase(&state, "production-pollution"), CircuitPhase::Open);
}
