use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::context::StoreContext;

use super::atomic::write_atomic;
use super::paths::{pending_path, project_dir, PENDING_FILE};
use super::StorageError;

/// Contents of a project's transaction marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub operation: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// An in-flight marker. Dropping it without [`Transaction::commit`] rolls
/// it back, so every early return clears the marker.
#[derive(Debug)]
pub struct Transaction {
    project: String,
    path: PathBuf,
    finished: bool,
}

impl Transaction {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        remove_marker(&self.path)?;
        debug!(project = %self.project, "committed transaction");
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        remove_marker(&self.path)?;
        debug!(project = %self.project, "rolled back transaction");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match remove_marker(&self.path) {
            Ok(()) => debug!(project = %self.project, "rolled back transaction on drop"),
            Err(err) => {
                debug!(project = %self.project, error = %err, "failed to remove transaction marker")
            }
        }
    }
}

fn remove_marker(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Records the intent to run `operation` before any file is touched.
pub fn begin_transaction(
    ctx: &StoreContext,
    project_key: &str,
    operation: &str,
    metadata: Map<String, Value>,
) -> Result<Transaction, StorageError> {
    let dir = project_dir(ctx, project_key)?;
    fs::create_dir_all(&dir)?;
    let path = dir.join(PENDING_FILE);

    let marker = PendingTransaction {
        operation: operation.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        metadata,
    };
    let body = serde_json::to_vec_pretty(&marker).map_err(StorageError::Encode)?;
    write_atomic(&path, &body)?;
    debug!(project = project_key, operation, "began transaction");

    Ok(Transaction {
        project: project_key.to_string(),
        path,
        finished: false,
    })
}

pub fn commit_transaction(ctx: &StoreContext, project_key: &str) -> Result<(), StorageError> {
    remove_marker(&pending_path(ctx, project_key)?)
}

/// Same effect as [`commit_transaction`]; kept separate for call-site
/// readability.
pub fn rollback_transaction(ctx: &StoreContext, project_key: &str) -> Result<(), StorageError> {
    commit_transaction(ctx, project_key)
}

pub fn check_pending_transaction(
    ctx: &StoreContext,
    project_key: &str,
) -> Result<Option<PendingTransaction>, StorageError> {
    let path = pending_path(ctx, project_key)?;
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let marker = serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
        path: path.clone(),
        source,
    })?;
    Ok(Some(marker))
}
