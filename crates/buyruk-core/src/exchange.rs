//! Portable single-file export of a project and the matching import.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::context::StoreContext;
use crate::models::{
    now_rfc3339, parse_issue_id, validate_project_key, Epic, IndexEntry, Issue, ModelError,
    ProjectIndex,
};
use crate::project::{self, ProjectError};
use crate::storage::{
    self, epic_path, issue_path, list_record_ids, project_dir, project_index_path, Collection,
    StorageError,
};

pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Export file is missing its version")]
    MissingVersion,
    #[error("Invalid project data in export: {0}")]
    InvalidProject(#[source] ModelError),
    #[error("Project {0} already exists (use --overwrite to replace it)")]
    AlreadyExists(String),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub version: String,
    pub exported_at: String,
    pub project: ProjectIndex,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub epics: Vec<Epic>,
}

impl ExportBundle {
    /// Checks the envelope only. Individual records are validated during
    /// import so that one bad record does not reject the whole file.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.version.trim().is_empty() {
            return Err(ExchangeError::MissingVersion);
        }
        self.project
            .validate()
            .and_then(|_| validate_project_key(&self.project.project_key))
            .map_err(ExchangeError::InvalidProject)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub key: String,
    pub issues: usize,
    pub epics: usize,
    pub skipped: Vec<String>,
}

/// Collects the index and every readable issue and epic record.
/// Records that fail to load are left out.
pub fn export_project(ctx: &StoreContext, key: &str) -> Result<ExportBundle, ExchangeError> {
    let index = project::load_index(ctx, key)?;
    let mut issues = Vec::new();
    for entry in &index.issues {
        let path = issue_path(ctx, key, &entry.id)?;
        match storage::read::<Issue>(&path) {
            Ok(issue) => issues.push(issue),
            Err(err) => debug!(project = key, id = %entry.id, error = %err, "skipping issue"),
        }
    }
    let mut epics = Vec::new();
    for id in list_record_ids(ctx, key, Collection::Epics)? {
        let path = epic_path(ctx, key, &id)?;
        match storage::read::<Epic>(&path) {
            Ok(epic) => epics.push(epic),
            Err(err) => debug!(project = key, id = %id, error = %err, "skipping epic"),
        }
    }
    Ok(ExportBundle {
        version: EXPORT_VERSION.to_string(),
        exported_at: now_rfc3339(),
        project: index,
        issues,
        epics,
    })
}

pub fn write_bundle(path: &Path, bundle: &ExportBundle) -> Result<(), ExchangeError> {
    let bytes = storage::to_pretty_json(bundle)?;
    storage::write_atomic(path, &bytes)?;
    Ok(())
}

pub fn read_bundle(path: &Path) -> Result<ExportBundle, ExchangeError> {
    let bundle: ExportBundle = storage::read(path)?;
    bundle.validate()?;
    Ok(bundle)
}

/// Writes every record of `bundle` into the store and rebuilds the index
/// from the issues that were imported.
///
/// An existing project is refused unless `overwrite` is set, in which case
/// it is deleted first (which itself refuses a project with a pending
/// transaction).
pub fn import_project(
    ctx: &StoreContext,
    bundle: ExportBundle,
    overwrite: bool,
) -> Result<ImportSummary, ExchangeError> {
    bundle.validate()?;
    let key = bundle.project.project_key.clone();
    if project_dir(ctx, &key)?.exists() {
        if !overwrite {
            return Err(ExchangeError::AlreadyExists(key));
        }
        project::delete_project(ctx, &key, false)?;
    }
    for collection in Collection::ALL {
        let dir = storage::collection_dir(ctx, &key, collection)?;
        fs::create_dir_all(&dir).map_err(StorageError::from)?;
    }

    let mut summary = ImportSummary {
        key: key.clone(),
        ..ImportSummary::default()
    };

    for epic in &bundle.epics {
        if let Err(err) = epic.validate() {
            summary.skipped.push(format!("epic {}: {err}", epic.id));
            continue;
        }
        let path = epic_path(ctx, &key, &epic.id)?;
        storage::write_unconditional(ctx, &path, epic)?;
        summary.epics += 1;
    }

    let mut entries = Vec::new();
    for issue in &bundle.issues {
        if let Err(err) = issue.validate() {
            summary.skipped.push(format!("issue {}: {err}", issue.id));
            continue;
        }
        match parse_issue_id(&issue.id) {
            Ok((issue_key, _)) if issue_key == key => {}
            _ => {
                summary
                    .skipped
                    .push(format!("issue {}: does not belong to project {key}", issue.id));
                continue;
            }
        }
        let path = issue_path(ctx, &key, &issue.id)?;
        storage::write_unconditional(ctx, &path, issue)?;
        entries.push(IndexEntry::from(issue));
        summary.issues += 1;
    }

    let mut index = bundle.project;
    index.issues = entries;
    index.touch();
    let index_path = project_index_path(ctx, &key)?;
    storage::write_unconditional(ctx, &index_path, &index)?;
    debug!(project = %key, issues = summary.issues, epics = summary.epics, "imported project");
    Ok(summary)
}
