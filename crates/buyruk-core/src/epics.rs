use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::context::StoreContext;
use crate::issues::MAX_ID_ATTEMPTS;
use crate::models::{
    epic_sequence, now_rfc3339, validate_record_id, Epic, IndexEntry, ModelError, Status,
};
use crate::project::{self, ProjectError};
use crate::storage::{self, epic_path, list_record_ids, Collection, StorageError};

pub const EPIC_PREFIX: &str = "E";

#[derive(Debug, Error)]
pub enum EpicError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("Epic {0} not found")]
    NotFound(String),
    #[error("Epic {0} already exists")]
    AlreadyExists(String),
    #[error("Could not find a free epic id for project {project} after {attempts} attempts")]
    IdsExhausted { project: String, attempts: u64 },
    #[error("Epic numbers for project {0} are exhausted; pass an explicit id")]
    SequenceExhausted(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default)]
pub struct NewEpic {
    pub title: String,
    pub id: Option<String>,
    pub status: Status,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EpicPatch {
    pub title: Option<String>,
    pub status: Option<Status>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpicView {
    pub epic: Epic,
    pub issues: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EpicListing {
    pub epics: Vec<Epic>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletedEpic {
    pub id: String,
    /// Issues still pointing at the deleted epic. They are left untouched.
    pub linked_issues: Vec<String>,
}

/// Next `E-<n>` sequence from the files in `epics/`.
pub fn next_epic_sequence(ctx: &StoreContext, project_key: &str) -> Result<u64, EpicError> {
    let max = list_record_ids(ctx, project_key, Collection::Epics)?
        .iter()
        .filter_map(|id| epic_sequence(id))
        .max()
        .unwrap_or(0);
    max.checked_add(1)
        .ok_or_else(|| EpicError::SequenceExhausted(project_key.to_string()))
}

pub fn create_epic(
    ctx: &StoreContext,
    project_key: &str,
    new: NewEpic,
) -> Result<Epic, EpicError> {
    project::ensure_project(ctx, project_key)?;
    let now = now_rfc3339();
    let mut epic = Epic {
        id: String::new(),
        title: new.title.trim().to_string(),
        description: new.description.filter(|text| !text.trim().is_empty()),
        status: new.status,
        created_at: Some(now.clone()),
        updated_at: Some(now),
    };
    if epic.title.is_empty() {
        return Err(ModelError::MissingTitle.into());
    }

    if let Some(id) = new.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
        validate_record_id(&id)?;
        epic.id = id;
        let path = epic_path(ctx, project_key, &epic.id)?;
        return match storage::create_if_absent(ctx, &path, &epic) {
            Ok(()) => Ok(epic),
            Err(err) if err.is_already_exists() => Err(EpicError::AlreadyExists(epic.id)),
            Err(err) => Err(err.into()),
        };
    }

    let start = next_epic_sequence(ctx, project_key)?;
    let candidates = (0..MAX_ID_ATTEMPTS).map_while(|offset| start.checked_add(offset));
    for sequence in candidates {
        epic.id = format!("{EPIC_PREFIX}-{sequence}");
        let path = epic_path(ctx, project_key, &epic.id)?;
        match storage::create_if_absent(ctx, &path, &epic) {
            Ok(()) => {
                debug!(project = project_key, id = %epic.id, "created epic");
                return Ok(epic);
            }
            Err(err) if err.is_already_exists() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(EpicError::IdsExhausted {
        project: project_key.to_string(),
        attempts: MAX_ID_ATTEMPTS,
    })
}

fn load_epic(ctx: &StoreContext, project_key: &str, epic_id: &str) -> Result<Epic, EpicError> {
    validate_record_id(epic_id)?;
    let path = epic_path(ctx, project_key, epic_id)?;
    match storage::read::<Epic>(&path) {
        Ok(epic) => Ok(epic),
        Err(err) if err.is_not_found() => Err(EpicError::NotFound(epic_id.to_string())),
        Err(err) => Err(err.into()),
    }
}

fn linked_entries(
    ctx: &StoreContext,
    project_key: &str,
    epic_id: &str,
) -> Result<Vec<IndexEntry>, EpicError> {
    let index = project::load_index(ctx, project_key)?;
    Ok(index
        .issues
        .into_iter()
        .filter(|entry| entry.epic_id.as_deref() == Some(epic_id))
        .collect())
}

pub fn view_epic(
    ctx: &StoreContext,
    project_key: &str,
    epic_id: &str,
) -> Result<EpicView, EpicError> {
    let epic = load_epic(ctx, project_key, epic_id)?;
    let issues = linked_entries(ctx, project_key, epic_id)?;
    Ok(EpicView { epic, issues })
}

pub fn update_epic(
    ctx: &StoreContext,
    project_key: &str,
    epic_id: &str,
    patch: EpicPatch,
) -> Result<Epic, EpicError> {
    load_epic(ctx, project_key, epic_id)?;
    let path = epic_path(ctx, project_key, epic_id)?;
    storage::update_in_place(ctx, &path, |epic: &mut Epic| {
        if epic.id != epic_id {
            return Err(EpicError::NotFound(epic_id.to_string()));
        }
        if let Some(title) = patch.title {
            epic.title = title.trim().to_string();
        }
        if let Some(status) = patch.status {
            epic.status = status;
        }
        if let Some(description) = patch.description {
            epic.description = Some(description).filter(|text| !text.trim().is_empty());
        }
        epic.validate()?;
        epic.updated_at = Some(now_rfc3339());
        Ok(())
    })
}

/// Every epic in the project ordered by sequence. Unreadable files are
/// reported in `warnings`.
pub fn list_epics(ctx: &StoreContext, project_key: &str) -> Result<EpicListing, EpicError> {
    project::ensure_project(ctx, project_key)?;
    let mut listing = EpicListing::default();
    for id in list_record_ids(ctx, project_key, Collection::Epics)? {
        match load_epic(ctx, project_key, &id) {
            Ok(epic) => listing.epics.push(epic),
            Err(err) => listing.warnings.push(format!("{id}: {err}")),
        }
    }
    listing
        .epics
        .sort_by_key(|epic| (epic_sequence(&epic.id).unwrap_or(u64::MAX), epic.id.clone()));
    Ok(listing)
}

pub fn delete_epic(
    ctx: &StoreContext,
    project_key: &str,
    epic_id: &str,
) -> Result<DeletedEpic, EpicError> {
    load_epic(ctx, project_key, epic_id)?;
    let linked_issues = linked_entries(ctx, project_key, epic_id)?
        .into_iter()
        .map(|entry| entry.id)
        .collect();
    let path = epic_path(ctx, project_key, epic_id)?;
    match storage::delete_record(ctx, &path) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Err(EpicError::NotFound(epic_id.to_string())),
        Err(err) => return Err(err.into()),
    }
    debug!(project = project_key, id = epic_id, "deleted epic");
    Ok(DeletedEpic {
        id: epic_id.to_string(),
        linked_issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::{create_issue, NewIssue};
    use crate::project::create_project;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StoreContext) {
        let temp = TempDir::new().expect("tempdir");
        let ctx = StoreContext::new(temp.path());
        create_project(&ctx, "CORE", None).expect("project");
        (temp, ctx)
    }

    fn titled(title: &str) -> NewEpic {
        NewEpic {
            title: title.to_string(),
            ..NewEpic::default()
        }
    }

    #[test]
    fn create_numbers_epics_sequentially() {
        let (_temp, ctx) = setup();
        assert_eq!(create_epic(&ctx, "CORE", titled("One")).expect("one").id, "E-1");
        assert_eq!(create_epic(&ctx, "CORE", titled("Two")).expect("two").id, "E-2");

        let explicit = NewEpic {
            id: Some("E-10".to_string()),
            ..titled("Ten")
        };
        create_epic(&ctx, "CORE", explicit.clone()).expect("ten");
        assert!(matches!(
            create_epic(&ctx, "CORE", explicit),
            Err(EpicError::AlreadyExists(_))
        ));
        assert_eq!(create_epic(&ctx, "CORE", titled("Next")).expect("next").id, "E-11");
    }

    #[test]
    fn create_rejects_bad_input() {
        let (_temp, ctx) = setup();
        assert!(matches!(
            create_epic(&ctx, "CORE", titled("")),
            Err(EpicError::Model(ModelError::MissingTitle))
        ));
        let bad_id = NewEpic {
            id: Some("../E-1".to_string()),
            ..titled("Escape")
        };
        assert!(matches!(
            create_epic(&ctx, "CORE", bad_id),
            Err(EpicError::Model(ModelError::InvalidRecordId(_)))
        ));
    }

    #[test]
    fn view_lists_linked_issues() {
        let (_temp, ctx) = setup();
        create_epic(&ctx, "CORE", titled("Launch")).expect("epic");
        let linked = NewIssue {
            title: "Linked".to_string(),
            epic_id: Some("E-1".to_string()),
            ..NewIssue::default()
        };
        create_issue(&ctx, "CORE", linked).expect("linked");
        let loose = NewIssue {
            title: "Loose".to_string(),
            ..NewIssue::default()
        };
        create_issue(&ctx, "CORE", loose).expect("loose");

        let view = view_epic(&ctx, "CORE", "E-1").expect("view");
        assert_eq!(view.epic.title, "Launch");
        assert_eq!(view.issues.len(), 1);
        assert_eq!(view.issues[0].id, "CORE-1");
        assert!(matches!(view_epic(&ctx, "CORE", "E-5"), Err(EpicError::NotFound(_))));
    }

    #[test]
    fn update_and_delete() {
        let (_temp, ctx) = setup();
        create_epic(&ctx, "CORE", titled("Draft")).expect("epic");
        let patch = EpicPatch {
            title: Some("Final".to_string()),
            status: Some(Status::Done),
            ..EpicPatch::default()
        };
        let updated = update_epic(&ctx, "CORE", "E-1", patch).expect("update");
        assert_eq!(updated.title, "Final");
        assert_eq!(updated.status, Status::Done);

        let deleted = delete_epic(&ctx, "CORE", "E-1").expect("delete");
        assert!(deleted.linked_issues.is_empty());
        assert!(matches!(
            update_epic(&ctx, "CORE", "E-1", EpicPatch::default()),
            Err(EpicError::NotFound(_))
        ));
    }

    #[test]
    fn create_stops_at_the_largest_sequence() {
        let (_temp, ctx) = setup();
        let explicit = NewEpic {
            id: Some("E-18446744073709551610".to_string()),
            ..titled("Near the end")
        };
        create_epic(&ctx, "CORE", explicit).expect("explicit");
        for expected in 11..=15 {
            let epic = create_epic(&ctx, "CORE", titled("tail")).expect("tail");
            assert_eq!(epic.id, format!("E-184467440737095516{expected}"));
        }
        assert!(matches!(
            create_epic(&ctx, "CORE", titled("Overflow")),
            Err(EpicError::SequenceExhausted(_))
        ));
    }

    #[test]
    fn list_orders_by_sequence_and_reports_broken_files() {
        let (_temp, ctx) = setup();
        for title in ["a", "b"] {
            create_epic(&ctx, "CORE", titled(title)).expect("epic");
        }
        let explicit = NewEpic {
            id: Some("E-10".to_string()),
            ..titled("ten")
        };
        create_epic(&ctx, "CORE", explicit).expect("ten");
        let broken = epic_path(&ctx, "CORE", "E-3").expect("path");
        fs::write(broken.path(), "[]").expect("broken");

        let listing = list_epics(&ctx, "CORE").expect("list");
        let ids: Vec<&str> = listing.epics.iter().map(|epic| epic.id.as_str()).collect();
        assert_eq!(ids, vec!["E-1", "E-2", "E-10"]);
        assert_eq!(listing.warnings.len(), 1);
    }
}
