//! Durable storage: the locked Policy Store and the evaluation log.

pub mod evaluation_log;
pub mod lock;
pub mod policy_store;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use evaluation_log::{EvaluationLog, EvaluationRecord};
pub use lock::StoreLock;
pub use policy_store::{LoadOutcome, PolicyStore, Transaction};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("lock {} not acquired within {waited_ms}ms", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },
    #[error("policy state {} is unreadable ({reason}); run `reset --all` to quarantine it", .path.display())]
    Unreadable { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
