use std::fs;
use std::io::ErrorKind;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::StoreContext;
use crate::models::{
    parse_issue_id, validate_project_key, IndexEntry, Issue, ModelError, ProjectIndex,
};
use crate::storage::{
    self, acquire_lock, begin_transaction, check_lock, check_pending_transaction,
    list_record_ids, project_dir, project_index_path, projects_dir, Collection,
    PendingTransaction, StorageError,
};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Project {0} already exists")]
    AlreadyExists(String),
    #[error("Project {0} does not exist")]
    NotFound(String),
    #[error(
        "Project {key} has a pending transaction ({operation} at {timestamp}); \
         the last write may have been interrupted. Run `project repair {key}` or force the deletion"
    )]
    PendingTransaction {
        key: String,
        operation: String,
        timestamp: String,
    },
    #[error("Project {key} is locked by another operation; force the deletion to proceed anyway")]
    Locked {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub key: String,
    pub name: Option<String>,
    pub issues: usize,
    pub epics: usize,
    pub locked: bool,
    pub pending: Option<PendingTransaction>,
    /// Set when `project.json` is missing or unreadable. Counts come from
    /// the record files, so they stay accurate either way.
    pub index_warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairReport {
    pub key: String,
    pub indexed: usize,
    pub skipped: Vec<String>,
    /// Marker found before the repair ran. The repair's own write replaces
    /// and then clears it.
    pub pending: Option<PendingTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub key: String,
    pub issues: usize,
    pub epics: usize,
    pub forced: bool,
}

/// A project exists once its index has been written.
pub fn project_exists(ctx: &StoreContext, key: &str) -> Result<bool, ProjectError> {
    validate_project_key(key)?;
    let path = project_index_path(ctx, key)?;
    Ok(path.path().try_exists().map_err(StorageError::from)?)
}

pub(crate) fn ensure_project(ctx: &StoreContext, key: &str) -> Result<(), ProjectError> {
    if !project_exists(ctx, key)? {
        return Err(ProjectError::NotFound(key.to_string()));
    }
    Ok(())
}

pub fn load_index(ctx: &StoreContext, key: &str) -> Result<ProjectIndex, ProjectError> {
    validate_project_key(key)?;
    let path = project_index_path(ctx, key)?;
    match storage::read::<ProjectIndex>(&path) {
        Ok(index) => Ok(index),
        Err(err) if err.is_not_found() => Err(ProjectError::NotFound(key.to_string())),
        Err(err) => Err(err.into()),
    }
}

/// Creates the index plus empty `issues/` and `epics/` directories.
///
/// The index is written with `create_if_absent`, so two processes racing to
/// create the same key cannot both succeed.
pub fn create_project(
    ctx: &StoreContext,
    key: &str,
    name: Option<&str>,
) -> Result<ProjectIndex, ProjectError> {
    validate_project_key(key)?;
    let name = name.map(str::trim).filter(|value| !value.is_empty());
    let index = ProjectIndex::new(key, name);
    let path = project_index_path(ctx, key)?;
    match storage::create_if_absent(ctx, &path, &index) {
        Ok(()) => {}
        Err(err) if err.is_already_exists() => {
            return Err(ProjectError::AlreadyExists(key.to_string()))
        }
        Err(err) => return Err(err.into()),
    }
    for collection in Collection::ALL {
        let dir = storage::collection_dir(ctx, key, collection)?;
        fs::create_dir_all(&dir).map_err(StorageError::from)?;
    }
    debug!(project = key, "created project");
    Ok(index)
}

/// Rebuilds `project.json` from the issue files on disk.
///
/// Unreadable or invalid issue files are reported and left out of the
/// index rather than failing the repair. The repair's own write clears a
/// pending transaction marker.
pub fn repair_project(ctx: &StoreContext, key: &str) -> Result<RepairReport, ProjectError> {
    validate_project_key(key)?;
    let dir = project_dir(ctx, key)?;
    if !dir.is_dir() {
        return Err(ProjectError::NotFound(key.to_string()));
    }
    let pending = check_pending_transaction(ctx, key)?;
    if let Some(marker) = &pending {
        warn!(
            project = key,
            operation = %marker.operation,
            timestamp = %marker.timestamp,
            "repairing project with a pending transaction"
        );
    }

    let mut entries = Vec::new();
    let mut skipped = Vec::new();
    for id in list_record_ids(ctx, key, Collection::Issues)? {
        let path = storage::issue_path(ctx, key, &id)?;
        let issue = match storage::read::<Issue>(&path) {
            Ok(issue) => issue,
            Err(err) => {
                skipped.push(format!("{id}: {err}"));
                continue;
            }
        };
        if let Err(err) = issue.validate() {
            skipped.push(format!("{id}: {err}"));
            continue;
        }
        if issue.id != id {
            skipped.push(format!("{id}: file holds issue {:?}", issue.id));
            continue;
        }
        entries.push(IndexEntry::from(&issue));
    }
    entries.sort_by_key(|entry| {
        parse_issue_id(&entry.id)
            .map(|(_, seq)| seq)
            .unwrap_or(u64::MAX)
    });
    let indexed = entries.len();

    // A corrupt index is replaced; a readable one keeps its name and
    // creation time.
    let index_path = project_index_path(ctx, key)?;
    let mut index = storage::read_optional::<ProjectIndex>(&index_path)
        .ok()
        .flatten()
        .unwrap_or_else(|| ProjectIndex::new(key, None));
    index.project_key = key.to_string();
    index.issues = entries;
    index.touch();
    storage::write_unconditional(ctx, &index_path, &index)?;
    debug!(project = key, indexed, skipped = skipped.len(), "repaired project");

    Ok(RepairReport {
        key: key.to_string(),
        indexed,
        skipped,
        pending,
    })
}

/// Counts and status flags for a project. Takes no lock.
/// Summary of a project directory. A corrupt or missing index does not
/// fail the summary, so callers can still delete or repair the project.
pub fn project_summary(ctx: &StoreContext, key: &str) -> Result<ProjectSummary, ProjectError> {
    validate_project_key(key)?;
    if !project_dir(ctx, key)?.is_dir() {
        return Err(ProjectError::NotFound(key.to_string()));
    }
    let index_path = project_index_path(ctx, key)?;
    let (name, index_warning) = match storage::read_optional::<ProjectIndex>(&index_path) {
        Ok(Some(index)) => (index.project_name, None),
        Ok(None) => (None, Some("project index is missing".to_string())),
        Err(err) => {
            warn!(project = key, error = %err, "project index is unreadable");
            (None, Some(err.to_string()))
        }
    };
    Ok(ProjectSummary {
        key: key.to_string(),
        name,
        issues: list_record_ids(ctx, key, Collection::Issues)?.len(),
        epics: list_record_ids(ctx, key, Collection::Epics)?.len(),
        locked: check_lock(ctx, key)?,
        pending: check_pending_transaction(ctx, key)?,
        index_warning,
    })
}

/// Removes the whole project directory while holding its lock.
///
/// A pending transaction or a lock held past the timeout refuses the
/// deletion unless `force` is set.
pub fn delete_project(
    ctx: &StoreContext,
    key: &str,
    force: bool,
) -> Result<DeleteReport, ProjectError> {
    validate_project_key(key)?;
    let dir = project_dir(ctx, key)?;
    if !dir.is_dir() {
        return Err(ProjectError::NotFound(key.to_string()));
    }

    let mut forced = false;
    if let Some(marker) = check_pending_transaction(ctx, key)? {
        if !force {
            return Err(ProjectError::PendingTransaction {
                key: key.to_string(),
                operation: marker.operation,
                timestamp: marker.timestamp,
            });
        }
        warn!(
            project = key,
            operation = %marker.operation,
            "deleting project despite pending transaction"
        );
        forced = true;
    }

    let lock = match acquire_lock(ctx, key) {
        Ok(lock) => Some(lock),
        Err(err) if err.is_lock_timeout() && force => {
            warn!(project = key, "deleting project without its lock");
            forced = true;
            None
        }
        Err(err) if err.is_lock_timeout() => {
            return Err(ProjectError::Locked {
                key: key.to_string(),
                source: err,
            })
        }
        Err(err) => return Err(err.into()),
    };

    let issues = list_record_ids(ctx, key, Collection::Issues)?.len();
    let epics = list_record_ids(ctx, key, Collection::Epics)?.len();

    let mut metadata = Map::new();
    metadata.insert("project_key".to_string(), Value::String(key.to_string()));
    let tx = begin_transaction(ctx, key, "delete_project", metadata)?;
    fs::remove_dir_all(&dir).map_err(StorageError::from)?;
    tx.commit()?;
    if let Some(lock) = lock {
        lock.release()?;
    }
    debug!(project = key, issues, epics, forced, "deleted project");

    Ok(DeleteReport {
        key: key.to_string(),
        issues,
        epics,
        forced,
    })
}

/// Keys of every directory under `projects/` that holds an index.
pub fn list_projects(ctx: &StoreContext) -> Result<Vec<String>, ProjectError> {
    let entries = match fs::read_dir(projects_dir(ctx)) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StorageError::from(err).into()),
    };
    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.map_err(StorageError::from)?;
        let Some(key) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if validate_project_key(&key).is_ok() && project_exists(ctx, &key)? {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

/// Surfaces a marker left behind by an interrupted write. The marker is
/// only reported, never acted upon.
pub fn startup_check(
    ctx: &StoreContext,
    key: &str,
) -> Result<Option<PendingTransaction>, ProjectError> {
    validate_project_key(key)?;
    let pending = check_pending_transaction(ctx, key)?;
    if let Some(marker) = &pending {
        warn!(
            project = key,
            operation = %marker.operation,
            timestamp = %marker.timestamp,
            "found pending transaction; the last write may have been interrupted"
        );
    }
    Ok(pending)
}
