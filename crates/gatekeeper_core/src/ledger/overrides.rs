//! Override ledger: append-only record of every forced override of a DENY.
//!
//! Events are never edited. They leave the ledger only through the retention sweep
//! (`prune`), which the host's maintenance job runs; the gate itself never prunes.
//!
//! Catastrophic overrides additionally leave a grant for the exact `(rule_id, target)`
//! pair. A grant carrying a session id applies to that session only; a grant without
//! one (administrative override) applies to every session. Grants age out under the
//! same retention policy as events, keyed on `granted_at_ms`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEvent {
    pub rule_id: String,
    pub target: String,
    pub timestamp_ms: u64,
    pub reason_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatastrophicGrant {
    pub rule_id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub granted_at_ms: u64,
}

impl CatastrophicGrant {
    fn covers(&self, rule_id: &str, target: &str, session_id: &str) -> bool {
        self.rule_id == rule_id
            && self.target == target
            && self
                .session_id
                .as_deref()
                .is_none_or(|granted| granted == session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_count: usize,
}

/// What one retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    pub events: usize,
    pub grants: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideLedger {
    #[serde(default)]
    events: Vec<OverrideEvent>,
    #[serde(default)]
    grants: Vec<CatastrophicGrant>,
}

impl OverrideLedger {
    pub fn append(&mut self, event: OverrideEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[OverrideEvent] {
        &self.events
    }

    pub fn grants(&self) -> &[CatastrophicGrant] {
        &self.grants
    }

    pub fn count_for(&self, rule_id: &str) -> usize {
        self.events.iter().filter(|e| e.rule_id == rule_id).count()
    }

    pub fn grant(
        &mut self,
        rule_id: &str,
        target: &str,
        session_id: Option<&str>,
        granted_at_ms: u64,
    ) {
        let exists = self.grants.iter().any(|g| {
            g.rule_id == rule_id && g.target == target && g.session_id.as_deref() == session_id
        });
        if !exists {
            self.grants.push(CatastrophicGrant {
                rule_id: rule_id.to_string(),
                target: target.to_string(),
                session_id: session_id.map(str::to_string),
                granted_at_ms,
            });
        }
    }

    pub fn has_grant(&self, rule_id: &str, target: &str, session_id: &str) -> bool {
        self.grants
            .iter()
            .any(|grant| grant.covers(rule_id, target, session_id))
    }

    pub fn grants_for(&self, rule_id: &str) -> usize {
        self.grants.iter().filter(|g| g.rule_id == rule_id).count()
    }

    pub fn revoke_grants(&mut self, rule_id: &str) {
        self.grants.retain(|g| g.rule_id != rule_id);
    }

    pub fn revoke_all_grants(&mut self) {
        self.grants.clear();
    }

    /// Retention sweep: drop events and grants older than `max_age`, then the oldest
    /// of each beyond `max_count`.
    pub fn prune(&mut self, now_ms: u64, policy: RetentionPolicy) -> PruneSummary {
        PruneSummary {
            events: retain_recent(&mut self.events, now_ms, policy, |e| e.timestamp_ms),
            grants: retain_recent(&mut self.grants, now_ms, policy, |g| g.granted_at_ms),
        }
    }
}

fn retain_recent<T>(
    items: &mut Vec<T>,
    now_ms: u64,
    policy: RetentionPolicy,
    stamp: impl Fn(&T) -> u64,
) -> usize {
    let before = items.len();
    let max_age_ms = policy.max_age.as_millis() as u64;
    items.retain(|item| now_ms.saturating_sub(stamp(item)) <= max_age_ms);
    if items.len() > policy.max_count {
        items.sort_by_key(&stamp);
        let excess = items.len() - policy.max_count;
        items.drain(..excess);
    }
    before - items.len()
}
