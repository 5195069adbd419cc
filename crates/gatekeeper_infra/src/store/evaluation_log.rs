//! Append-only evaluation log: one JSON line per handled event.
//!
//! Written for later pattern mining; the gate never reads it at runtime. Readers skip
//! malformed lines (a torn tail after a crash, say) with a warning.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use gatekeeper_core::rules::{ClassificationFault, Violation};
use gatekeeper_core::{GateDecision, GateEvent, GateOutcome};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub timestamp_ms: u64,
    pub turn: u64,
    pub event: GateEvent,
    pub decision: GateDecision,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub faults: Vec<ClassificationFault>,
    #[serde(default)]
    pub overrides_recorded: Vec<String>,
    /// True when the decision was made against an unreadable store and not persisted.
    #[serde(default)]
    pub degraded: bool,
}

impl EvaluationRecord {
    pub fn from_outcome(
        event: &GateEvent,
        outcome: &GateOutcome,
        turn: u64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            timestamp_ms,
            turn,
            event: event.clone(),
            decision: outcome.decision.clone(),
            violations: outcome.violations.clone(),
            faults: outcome.faults.clone(),
            overrides_recorded: outcome.overrides_recorded.clone(),
            degraded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationLog {
    path: PathBuf,
}

impl EvaluationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::io(parent, source))?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StoreError::io(&self.path, source))?;
        file.write_all(line.as_bytes())
            .map_err(|source| StoreError::io(&self.path, source))?;
        file.flush()
            .map_err(|source| StoreError::io(&self.path, source))?;
        Ok(())
    }

    /// Every well-formed record, oldest first. A missing log is empty.
    pub fn read_all(&self) -> Result<Vec<EvaluationRecord>, StoreError> {
        let Some(reader) = self.open_reader()? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| StoreError::io(&self.path, source))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EvaluationRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %err,
                    "skipping malformed evaluation log line"
                ),
            }
        }
        Ok(records)
    }

    /// Number of non-empty lines, well-formed or not.
    pub fn line_count(&self) -> Result<usize, StoreError> {
        let Some(reader) = self.open_reader()? else {
            return Ok(0);
        };
        let mut count = 0;
        for line in reader.lines() {
            let line = line.map_err(|source| StoreError::io(&self.path, source))?;
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn open_reader(&self) -> Result<Option<BufReader<File>>, StoreError> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::io(&self.path, source)),
        }
    }
}
