//! Durable Policy Store: one JSON document per policy domain.
//!
//! Layout under the state directory:
//! - `<domain>.json`          current `PolicyState`
//! - `<domain>.lock`          lock file serializing read-modify-write cycles
//! - `<domain>.events.jsonl`  append-only evaluation log
//!
//! Saves are atomic (temp file in the same directory, fsync, rename), so readers never
//! observe a partial document. A document that exists but cannot be read is never
//! overwritten: the caller runs on a default state that is not persisted, and only an
//! explicit `quarantine` moves the bad file aside.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gatekeeper_core::PolicyState;
use gatekeeper_core::state::STATE_SCHEMA_VERSION;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use super::StoreError;
use super::lock::StoreLock;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// No document on disk yet.
    Fresh(PolicyState),
    Loaded(PolicyState),
    /// A document exists but could not be read; `fallback` is a default state.
    Unreadable { fallback: PolicyState, reason: String },
}

impl LoadOutcome {
    pub fn state(&self) -> &PolicyState {
        match self {
            LoadOutcome::Fresh(state) | LoadOutcome::Loaded(state) => state,
            LoadOutcome::Unreadable { fallback, .. } => fallback,
        }
    }

    pub fn into_state(self) -> PolicyState {
        match self {
            LoadOutcome::Fresh(state) | LoadOutcome::Loaded(state) => state,
            LoadOutcome::Unreadable { fallback, .. } => fallback,
        }
    }

    pub fn is_unreadable(&self) -> bool {
        matches!(self, LoadOutcome::Unreadable { .. })
    }

    pub fn unreadable_reason(&self) -> Option<&str> {
        match self {
            LoadOutcome::Unreadable { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Result of a lock-scoped read-modify-write.
#[derive(Debug)]
pub struct Transaction<T> {
    pub value: T,
    /// False when the on-disk document was unreadable and was left untouched.
    pub persisted: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyStore {
    dir: PathBuf,
    domain: String,
    lock_timeout: Duration,
}

impl PolicyStore {
    pub fn new(dir: impl Into<PathBuf>, domain: impl Into<String>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            domain: domain.into(),
            lock_timeout,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.domain))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.domain))
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(format!("{}.events.jsonl", self.domain))
    }

    pub fn lock(&self) -> Result<StoreLock, StoreError> {
        StoreLock::acquire(&self.lock_path(), self.lock_timeout)
    }

    /// Read the current document. Callers mutating state must hold the lock.
    pub fn load(&self) -> LoadOutcome {
        let path = self.state_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return LoadOutcome::Fresh(PolicyState::default());
            }
            Err(err) => return self.unreadable(&path, format!("read failed: {err}")),
        };
        match serde_json::from_str::<PolicyState>(&raw) {
            Ok(state) if state.schema_version > STATE_SCHEMA_VERSION => self.unreadable(
                &path,
                format!(
                    "schema version {} is newer than supported {}",
                    state.schema_version, STATE_SCHEMA_VERSION
                ),
            ),
            Ok(state) => LoadOutcome::Loaded(state),
            Err(err) => self.unreadable(&path, format!("parse failed: {err}")),
        }
    }

    fn unreadable(&self, path: &Path, reason: String) -> LoadOutcome {
        error!(
            path = %path.display(),
            reason = %reason,
            "policy state unreadable; running on defaults and leaving the file untouched"
        );
        LoadOutcome::Unreadable {
            fallback: PolicyState::default(),
            reason,
        }
    }

    /// Atomically replace the document.
    pub fn save(&self, state: &PolicyState) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::io(&self.dir, source))?;
        let path = self.state_path();
        let bytes = serde_json::to_vec_pretty(state)?;

        let mut temp =
            NamedTempFile::new_in(&self.dir).map_err(|source| StoreError::io(&self.dir, source))?;
        temp.as_file_mut()
            .write_all(&bytes)
            .map_err(|source| StoreError::io(temp.path(), source))?;
        temp.as_file()
            .sync_all()
            .map_err(|source| StoreError::io(temp.path(), source))?;
        temp.persist(&path)
            .map_err(|err| StoreError::io(&path, err.error))?;
        Ok(())
    }

    /// Lock, load, apply `op`, save. When the document is unreadable `op` runs on a
    /// default state and nothing is written.
    pub fn transact<T>(
        &self,
        op: impl FnOnce(&mut PolicyState) -> T,
    ) -> Result<Transaction<T>, StoreError> {
        let _lock = self.lock()?;
        let loaded = self.load();
        let unreadable = loaded.is_unreadable();
        let mut state = loaded.into_state();
        let value = op(&mut state);
        if unreadable {
            warn!(domain = %self.domain, "state not persisted: on-disk document is unreadable");
            return Ok(Transaction {
                value,
                persisted: false,
            });
        }
        self.save(&state)?;
        Ok(Transaction {
            value,
            persisted: true,
        })
    }

    /// Like `transact`, but refuses to run against an unreadable document.
    pub fn transact_strict<T, E>(
        &self,
        op: impl FnOnce(&mut PolicyState) -> Result<T, E>,
    ) -> Result<Result<T, E>, StoreError> {
        let _lock = self.lock()?;
        let mut state = match self.load() {
            LoadOutcome::Unreadable { reason, .. } => {
                return Err(StoreError::Unreadable {
                    path: self.state_path(),
                    reason,
                });
            }
            loaded => loaded.into_state(),
        };
        let result = op(&mut state);
        if result.is_ok() {
            self.save(&state)?;
        }
        Ok(result)
    }

    /// Lock-scoped read.
    pub fn read(&self) -> Result<LoadOutcome, StoreError> {
        let _lock = self.lock()?;
        Ok(self.load())
    }

    /// Move an unreadable document aside to `<domain>.json.corrupt-<now_ms>` so a
    /// fresh one can be written. Returns the new path, or `None` when the document
    /// was readable or absent.
    pub fn quarantine(&self, now_ms: u64) -> Result<Option<PathBuf>, StoreError> {
        let _lock = self.lock()?;
        if !self.load().is_unreadable() {
            return Ok(None);
        }
        let path = self.state_path();
        let target = self
            .dir
            .join(format!("{}.json.corrupt-{now_ms}", self.domain));
        std::fs::rename(&path, &target).map_err(|source| StoreError::io(&path, source))?;
        info!(from = %path.display(), to = %target.display(), "unreadable policy state quarantined");
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> PolicyStore {
        PolicyStore::new(dir, "default", Duration::from_millis(200))
    }

    #[test]
    fn test_missing_document_loads_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            store(dir.path()).load(),
            LoadOutcome::Fresh(PolicyState::default())
        );
    }

    #[test]
    fn test_save_then_load_round_trips_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let mut state = PolicyState::default();
        state.turn_count = 42;

        store.save(&state).expect("save");

        assert_eq!(store.load(), LoadOutcome::Loaded(state));
    }

    #[test]
    fn test_newer_schema_is_unreadable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        std::fs::write(
            store.state_path(),
            r#"{"schema_version":99,"turn_count":1,"last_tuning_ms":null}"#,
        )
        .expect("write");

        assert!(store.load().is_unreadable());
    }

    #[test]
    fn test_strict_transaction_refuses_unreadable_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        std::fs::write(store.state_path(), "{ not json").expect("write");

        let result = store.transact_strict(|state| {
            state.turn_count += 1;
            Ok::<_, ()>(())
        });

        assert!(matches!(result, Err(StoreError::Unreadable { .. })));
        assert_eq!(
            std::fs::read_to_string(store.state_path()).expect("read"),
            "{ not json"
        );
    }
}
