//! Rule definitions: the immutable description of one policy rule.
//!
//! A rule is a compiled-in predicate plus the knobs the gate needs to enforce it:
//! category, sliding-window bound, base threshold, tunable range, cooldown schedule,
//! and exclusion patterns that bypass the rule entirely.
//!
//! Definitions are validated once when the catalog is built. A malformed definition is
//! fatal: the gate refuses to start rather than enforce a half-understood rule.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gate::GateEvent;

/// Compiled-in rule predicate. Returns true when the event violates the rule.
pub type RulePredicate = fn(&GateEvent) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    /// Zero tolerance. Blocks until an explicit override, never times out.
    Catastrophic,
    /// Trips after a tunable count within a sliding window; recovers via cooldown.
    Threshold,
}

impl RuleCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleCategory::Catastrophic => "catastrophic",
            RuleCategory::Threshold => "threshold",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            RuleCategory::Catastrophic => Severity::Critical,
            RuleCategory::Threshold => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
}

/// Bound of a rule's sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSpec {
    /// The last `n` processed events.
    Events(u64),
    /// The last `n` seconds of wall-clock time.
    Seconds(u64),
}

impl WindowSpec {
    pub fn is_empty(self) -> bool {
        match self {
            WindowSpec::Events(n) | WindowSpec::Seconds(n) => n == 0,
        }
    }

    pub fn describe(self) -> String {
        match self {
            WindowSpec::Events(n) => format!("last {n} events"),
            WindowSpec::Seconds(n) => format!("last {n}s"),
        }
    }
}

/// Closed interval a tuned threshold must stay inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TunableRange {
    pub min: f64,
    pub max: f64,
}

impl TunableRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn clamp(self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Ordered, non-decreasing cooldown durations applied on successive trips.
///
/// Once the end is reached the final entry repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownSchedule {
    steps: Vec<Duration>,
}

impl CooldownSchedule {
    /// The canonical schedule: 5s, 10s, 30s, 60s, then 300s forever.
    pub fn standard() -> Self {
        Self::from_secs(&[5, 10, 30, 60, 300])
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self {
            steps: secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// Catastrophic rules have no time-based recovery and so no schedule.
    pub fn none() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Highest valid attempt index (`len - 1`, or 0 for an empty schedule).
    pub fn last_index(&self) -> u32 {
        self.steps.len().saturating_sub(1) as u32
    }

    /// Cooldown for the given attempt, repeating the final step past the end.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let idx = (attempt_index as usize).min(self.steps.len().saturating_sub(1));
        self.steps.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// Index of the first step that is shorter than its predecessor, if any.
    fn first_decrease(&self) -> Option<usize> {
        self.steps
            .windows(2)
            .position(|pair| pair[1] < pair[0])
            .map(|pos| pos + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleConfigError {
    #[error("rule id must be non-empty")]
    EmptyId,
    #[error("duplicate rule id: {id}")]
    DuplicateId { id: String },
    #[error("unknown rule id: {id}")]
    UnknownRule { id: String },
    #[error("rule {id}: cooldown schedule must be non-empty")]
    EmptyCooldownSchedule { id: String },
    #[error("rule {id}: cooldown schedule decreases at step {index}")]
    DecreasingCooldownSchedule { id: String, index: usize },
    #[error("rule {id}: invalid tunable range [{min}, {max}]")]
    InvalidRange { id: String, min: f64, max: f64 },
    #[error("rule {id}: base threshold {base} outside tunable range [{min}, {max}]")]
    BaseThresholdOutOfRange {
        id: String,
        base: f64,
        min: f64,
        max: f64,
    },
    #[error("rule {id}: window must be non-zero")]
    EmptyWindow { id: String },
    #[error("rule {id}: invalid exclusion pattern {pattern:?}: {reason}")]
    InvalidExclusion {
        id: String,
        pattern: String,
        reason: String,
    },
    #[error("rule {id}: catastrophic rules do not accept {field}")]
    CatastrophicNotTunable { id: String, field: &'static str },
}

/// Immutable definition of one rule.
#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub id: String,
    pub description: String,
    pub category: RuleCategory,
    pub window: WindowSpec,
    pub base_threshold: f64,
    pub tunable_range: TunableRange,
    pub cooldown_schedule: CooldownSchedule,
    /// Target patterns that bypass this rule entirely.
    pub exclusions: Vec<Regex>,
    pub predicate: RulePredicate,
}

impl RuleDefinition {
    /// A zero-tolerance rule: threshold fixed at 1, no window, no cooldown.
    pub fn catastrophic(
        id: impl Into<String>,
        description: impl Into<String>,
        predicate: RulePredicate,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            category: RuleCategory::Catastrophic,
            window: WindowSpec::Events(1),
            base_threshold: 1.0,
            tunable_range: TunableRange::new(1.0, 1.0),
            cooldown_schedule: CooldownSchedule::none(),
            exclusions: Vec::new(),
            predicate,
        }
    }

    pub fn threshold(
        id: impl Into<String>,
        description: impl Into<String>,
        predicate: RulePredicate,
        window: WindowSpec,
        base_threshold: f64,
        tunable_range: TunableRange,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            category: RuleCategory::Threshold,
            window,
            base_threshold,
            tunable_range,
            cooldown_schedule: CooldownSchedule::standard(),
            exclusions: Vec::new(),
            predicate,
        }
    }

    pub fn with_cooldown_schedule(mut self, schedule: CooldownSchedule) -> Self {
        self.cooldown_schedule = schedule;
        self
    }

    /// Compile and append exclusion patterns.
    pub fn with_exclusions(mut self, patterns: &[&str]) -> Result<Self, RuleConfigError> {
        for pattern in patterns {
            self.add_exclusion(pattern)?;
        }
        Ok(self)
    }

    pub fn add_exclusion(&mut self, pattern: &str) -> Result<(), RuleConfigError> {
        let regex = Regex::new(pattern).map_err(|err| RuleConfigError::InvalidExclusion {
            id: self.id.clone(),
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        self.exclusions.push(regex);
        Ok(())
    }

    pub fn is_excluded(&self, target: &str) -> bool {
        self.exclusions.iter().any(|re| re.is_match(target))
    }

    pub fn is_catastrophic(&self) -> bool {
        self.category == RuleCategory::Catastrophic
    }

    pub fn validate(&self) -> Result<(), RuleConfigError> {
        if self.id.trim().is_empty() {
            return Err(RuleConfigError::EmptyId);
        }
        let range = self.tunable_range;
        if !range.min.is_finite() || !range.max.is_finite() || range.min <= 0.0 || range.min > range.max
        {
            return Err(RuleConfigError::InvalidRange {
                id: self.id.clone(),
                min: range.min,
                max: range.max,
            });
        }
        if !self.base_threshold.is_finite() || !range.contains(self.base_threshold) {
            return Err(RuleConfigError::BaseThresholdOutOfRange {
                id: self.id.clone(),
                base: self.base_threshold,
                min: range.min,
                max: range.max,
            });
        }
        if self.window.is_empty() {
            return Err(RuleConfigError::EmptyWindow {
                id: self.id.clone(),
            });
        }
        if self.category == RuleCategory::Threshold && self.cooldown_schedule.is_empty() {
            return Err(RuleConfigError::EmptyCooldownSchedule {
                id: self.id.clone(),
            });
        }
        if let Some(index) = self.cooldown_schedule.first_decrease() {
            return Err(RuleConfigError::DecreasingCooldownSchedule {
                id: self.id.clone(),
                index,
            });
        }
        Ok(())
    }
}

/// A single detected violation. Ephemeral: produced per evaluated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub category: RuleCategory,
    pub target: String,
    pub timestamp_ms: u64,
    pub severity: Severity,
}
