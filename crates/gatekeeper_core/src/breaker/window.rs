//! Sliding-window occurrence tracker, one independent window per rule.
//!
//! Marks are either event sequence numbers or wall-clock milliseconds, depending on
//! the rule's `WindowSpec`. Entries outside the window are evicted on every record
//! and lazily on read, so each window only ever holds in-window marks.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::rules::{RuleDefinition, WindowSpec};

/// Position of an evaluation on both clocks a window can be bounded by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub now_ms: u64,
    /// Sequence number of the processed event (the gate's turn counter).
    pub seq: u64,
}

impl Tick {
    pub fn new(now_ms: u64, seq: u64) -> Self {
        Self { now_ms, seq }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    marks: VecDeque<u64>,
}

impl WindowState {
    pub fn record(&mut self, spec: WindowSpec, tick: Tick) {
        self.marks.push_back(mark_for(spec, tick));
        self.evict(spec, tick);
    }

    pub fn count_in_window(&mut self, spec: WindowSpec, tick: Tick) -> usize {
        self.evict(spec, tick);
        self.marks.len()
    }

    pub fn evict(&mut self, spec: WindowSpec, tick: Tick) {
        while let Some(&oldest) = self.marks.front() {
            if in_window(spec, oldest, tick) {
                break;
            }
            self.marks.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.marks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }
}

fn mark_for(spec: WindowSpec, tick: Tick) -> u64 {
    match spec {
        WindowSpec::Events(_) => tick.seq,
        WindowSpec::Seconds(_) => tick.now_ms,
    }
}

fn in_window(spec: WindowSpec, mark: u64, tick: Tick) -> bool {
    match spec {
        WindowSpec::Events(n) => tick.seq.saturating_sub(mark) < n,
        WindowSpec::Seconds(secs) => tick.now_ms.saturating_sub(mark) < secs.saturating_mul(1000),
    }
}

/// Per-rule windows. No mark is ever shared between two rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowTracker {
    windows: BTreeMap<String, WindowState>,
}

impl WindowTracker {
    pub fn record(&mut self, rule: &RuleDefinition, tick: Tick) {
        self.windows
            .entry(rule.id.clone())
            .or_default()
            .record(rule.window, tick);
    }

    pub fn count_in_window(&mut self, rule: &RuleDefinition, tick: Tick) -> usize {
        self.windows
            .get_mut(&rule.id)
            .map(|window| window.count_in_window(rule.window, tick))
            .unwrap_or(0)
    }

    pub fn clear(&mut self, rule_id: &str) {
        if let Some(window) = self.windows.get_mut(rule_id) {
            window.clear();
        }
    }

    pub fn remove(&mut self, rule_id: &str) {
        self.windows.remove(rule_id);
    }

    pub fn clear_all(&mut self) {
        self.windows.clear();
    }

    pub fn get(&self, rule_id: &str) -> Option<&WindowState> {
        self.windows.get(rule_id)
    }
}
