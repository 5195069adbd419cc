use serde::{Deserialize, Serialize};

/// Outbound decision for one event. `message` is shown to the end user and never
/// carries internal errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub rule_id: Option<String>,
    pub message: String,
    pub retry_after_seconds: Option<u64>,
}

impl GateDecision {
    pub fn allow(message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            rule_id: None,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    /// Allowed as the HalfOpen probe for `rule_id`.
    pub fn probe(rule_id: &str, message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            rule_id: Some(rule_id.to_string()),
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn deny(rule_id: &str, message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self {
            allowed: false,
            rule_id: Some(rule_id.to_string()),
            message: message.into(),
            retry_after_seconds: retry_after_ms.map(ms_to_retry_secs),
        }
    }

    /// The gate could not evaluate; the action proceeds.
    pub fn fail_open() -> Self {
        Self::allow("policy gate unavailable; action allowed")
    }
}

/// Round a remaining cooldown up to whole seconds so a caller never retries early.
pub fn ms_to_retry_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}
