//! Filesystem record store.
//!
//! Every project lives in its own directory under `<base>/projects/<KEY>`.
//! Mutations of a project are serialized by a lock file, flagged by a
//! transaction marker while in flight, and land on disk through a
//! write-then-rename so readers never observe a partial record.

mod atomic;
mod lock;
mod paths;
mod store;
mod transaction;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use atomic::{ensure_parent_dir, temp_path, write_atomic};
pub use lock::{acquire_lock, check_lock, read_lock_holder, wait_for_lock, LockGuard};
pub use paths::{
    collection_dir, config_path, epic_path, issue_path, lock_path, pending_path, project_dir,
    project_index_path, projects_dir, record_path, resolve_path, Collection, RecordPath,
    CONFIG_FILE, EPICS_DIR, INDEX_FILE, ISSUES_DIR, LOCK_FILE, PENDING_FILE, PROJECTS_DIR,
    TEMP_SUFFIX,
};
pub use store::{
    create_if_absent, delete_record, list_record_ids, read, read_optional, to_pretty_json,
    update_in_place, update_in_place_from, write_unconditional,
};
pub use transaction::{
    begin_transaction, check_pending_transaction, commit_transaction, rollback_transaction,
    PendingTransaction, Transaction,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },
    #[error("Timed out after {timeout:?} waiting for the lock on project {project}")]
    LockTimeout { project: String, timeout: Duration },
    #[error("Record already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("Record not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn invalid(value: &str, reason: &'static str) -> Self {
        StorageError::InvalidIdentifier {
            value: value.to_string(),
            reason,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StorageError::LockTimeout { .. })
    }
}
