use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::StoreContext;
use crate::models::{
    generate_issue_id, now_rfc3339, parse_issue_id, validate_record_id, Issue, IssueType,
    ModelError, Priority, ProjectIndex, Status,
};
use crate::project::{self, ProjectError};
use crate::storage::{self, epic_path, issue_path, project_index_path, StorageError};

/// How many consecutive sequence numbers `create_issue` tries before
/// giving up when other writers keep claiming them.
pub const MAX_ID_ATTEMPTS: u64 = 16;

#[derive(Debug, Error)]
pub enum IssueError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("Issue {0} not found")]
    NotFound(String),
    #[error("Issue {0} already exists")]
    AlreadyExists(String),
    #[error("Issue id {id} does not belong to project {project}")]
    KeyMismatch { id: String, project: String },
    #[error("Epic {0} not found")]
    EpicNotFound(String),
    #[error("Dependency {0} not found")]
    DependencyNotFound(String),
    #[error("Issue {0} cannot depend on itself")]
    SelfDependency(String),
    #[error("Could not find a free issue id for project {project} after {attempts} attempts")]
    IdsExhausted { project: String, attempts: u64 },
    #[error("Issue numbers for project {0} are exhausted; pass an explicit id")]
    SequenceExhausted(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub id: Option<String>,
    pub issue_type: IssueType,
    pub status: Status,
    pub priority: Option<Priority>,
    pub description: Option<String>,
    pub epic_id: Option<String>,
}

/// Fields left as `None` keep their stored value. An empty `epic_id`
/// detaches the issue from its epic.
#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub issue_type: Option<IssueType>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub description: Option<String>,
    pub epic_id: Option<String>,
}

impl IssuePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.issue_type.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.description.is_none()
            && self.epic_id.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<Status>,
    pub epic_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueListing {
    pub issues: Vec<Issue>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletedIssue {
    pub id: String,
    /// Issues that listed the deleted one in `blocked_by`.
    pub dependents: Vec<String>,
    /// Set when the issue file is gone but the index could not be updated.
    pub index_warning: Option<String>,
    /// Set when dependents could not be determined, e.g. a corrupt index.
    pub dependents_warning: Option<String>,
}

fn project_of(issue_id: &str) -> Result<String, IssueError> {
    let (key, _) = parse_issue_id(issue_id)?;
    Ok(key)
}

fn ensure_epic(ctx: &StoreContext, project_key: &str, epic_id: &str) -> Result<(), IssueError> {
    validate_record_id(epic_id)?;
    let path = epic_path(ctx, project_key, epic_id)?;
    if !path.path().try_exists().map_err(StorageError::from)? {
        return Err(IssueError::EpicNotFound(epic_id.to_string()));
    }
    Ok(())
}

fn ensure_issue(ctx: &StoreContext, project_key: &str, issue_id: &str) -> Result<(), IssueError> {
    let path = issue_path(ctx, project_key, issue_id)?;
    if !path.path().try_exists().map_err(StorageError::from)? {
        return Err(IssueError::NotFound(issue_id.to_string()));
    }
    Ok(())
}

fn index_issue(ctx: &StoreContext, issue: &Issue) -> Result<(), IssueError> {
    let key = project_of(&issue.id)?;
    let path = project_index_path(ctx, &key)?;
    storage::update_in_place_from(
        ctx,
        &path,
        ProjectIndex::new(&key, None),
        |index: &mut ProjectIndex| {
            index.add_issue(issue);
            index.touch();
            Ok::<(), StorageError>(())
        },
    )?;
    Ok(())
}

/// Next sequence according to the index. Concurrent creators may read the
/// same value; `create_issue` resolves that by retrying.
pub fn next_issue_sequence(ctx: &StoreContext, project_key: &str) -> Result<u64, IssueError> {
    project::load_index(ctx, project_key)?
        .max_sequence()
        .checked_add(1)
        .ok_or_else(|| IssueError::SequenceExhausted(project_key.to_string()))
}

pub fn create_issue(
    ctx: &StoreContext,
    project_key: &str,
    new: NewIssue,
) -> Result<Issue, IssueError> {
    project::ensure_project(ctx, project_key)?;
    let title = new.title.trim().to_string();
    if title.is_empty() {
        return Err(ModelError::MissingTitle.into());
    }
    let epic_id = new
        .epic_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    if let Some(epic_id) = epic_id.as_deref() {
        ensure_epic(ctx, project_key, epic_id)?;
    }

    let now = now_rfc3339();
    let mut issue = Issue {
        id: String::new(),
        issue_type: new.issue_type,
        title,
        status: new.status,
        priority: new.priority,
        description: new.description.filter(|text| !text.trim().is_empty()),
        prs: Vec::new(),
        blocked_by: Vec::new(),
        epic_id,
        created_at: Some(now.clone()),
        updated_at: Some(now),
    };

    match new.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
        Some(id) => {
            if project_of(&id)? != project_key {
                return Err(IssueError::KeyMismatch {
                    id,
                    project: project_key.to_string(),
                });
            }
            issue.id = id;
            let path = issue_path(ctx, project_key, &issue.id)?;
            match storage::create_if_absent(ctx, &path, &issue) {
                Ok(()) => {}
                Err(err) if err.is_already_exists() => {
                    return Err(IssueError::AlreadyExists(issue.id))
                }
                Err(err) => return Err(err.into()),
            }
        }
        None => {
            let start = next_issue_sequence(ctx, project_key)?;
            let mut created = false;
            let candidates = (0..MAX_ID_ATTEMPTS).map_while(|offset| start.checked_add(offset));
            for sequence in candidates {
                issue.id = generate_issue_id(project_key, sequence);
                let path = issue_path(ctx, project_key, &issue.id)?;
                match storage::create_if_absent(ctx, &path, &issue) {
                    Ok(()) => {
                        created = true;
                        break;
                    }
                    Err(err) if err.is_already_exists() => {
                        debug!(project = project_key, id = %issue.id, "issue id taken, retrying");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if !created {
                return Err(IssueError::IdsExhausted {
                    project: project_key.to_string(),
                    attempts: MAX_ID_ATTEMPTS,
                });
            }
        }
    }

    index_issue(ctx, &issue)?;
    debug!(project = project_key, id = %issue.id, "created issue");
    Ok(issue)
}

/// Applies `mutate` to the stored issue under the project lock and mirrors
/// the result into the index.
fn modify_issue<F>(ctx: &StoreContext, issue_id: &str, mutate: F) -> Result<Issue, IssueError>
where
    F: FnOnce(&mut Issue) -> Result<(), IssueError>,
{
    let key = project_of(issue_id)?;
    ensure_issue(ctx, &key, issue_id)?;
    let path = issue_path(ctx, &key, issue_id)?;
    let issue = storage::update_in_place(ctx, &path, |issue: &mut Issue| {
        // Default means the file vanished between the check and the lock.
        if issue.id != issue_id {
            return Err(IssueError::NotFound(issue_id.to_string()));
        }
        mutate(issue)?;
        issue.validate()?;
        issue.touch();
        Ok(())
    })?;
    index_issue(ctx, &issue)?;
    Ok(issue)
}

pub fn update_issue(
    ctx: &StoreContext,
    issue_id: &str,
    patch: IssuePatch,
) -> Result<Issue, IssueError> {
    let key = project_of(issue_id)?;
    let epic_id = patch.epic_id.map(|id| id.trim().to_string());
    if let Some(epic_id) = epic_id.as_deref().filter(|id| !id.is_empty()) {
        ensure_epic(ctx, &key, epic_id)?;
    }
    modify_issue(ctx, issue_id, |issue| {
        if let Some(title) = patch.title {
            issue.title = title.trim().to_string();
        }
        if let Some(issue_type) = patch.issue_type {
            issue.issue_type = issue_type;
        }
        if let Some(status) = patch.status {
            issue.status = status;
        }
        if let Some(priority) = patch.priority {
            issue.priority = Some(priority);
        }
        if let Some(description) = patch.description {
            issue.description = Some(description).filter(|text| !text.trim().is_empty());
        }
        if let Some(epic_id) = epic_id {
            issue.epic_id = Some(epic_id).filter(|id| !id.is_empty());
        }
        Ok(())
    })
}

/// Adds `dependency_id` to the issue's `blocked_by`, or removes it when
/// `remove` is set.
pub fn link_issue(
    ctx: &StoreContext,
    issue_id: &str,
    dependency_id: &str,
    remove: bool,
) -> Result<Issue, IssueError> {
    let dependency_key = project_of(dependency_id)?;
    if issue_id == dependency_id {
        return Err(IssueError::SelfDependency(issue_id.to_string()));
    }
    if !remove {
        ensure_issue(ctx, &dependency_key, dependency_id)
            .map_err(|_| IssueError::DependencyNotFound(dependency_id.to_string()))?;
    }
    modify_issue(ctx, issue_id, |issue| {
        if remove {
            issue.remove_dependency(dependency_id);
        } else {
            issue.add_dependency(dependency_id);
        }
        Ok(())
    })
}

pub fn unlink_issue(
    ctx: &StoreContext,
    issue_id: &str,
    dependency_id: &str,
) -> Result<Issue, IssueError> {
    link_issue(ctx, issue_id, dependency_id, true)
}

pub fn add_pr(ctx: &StoreContext, issue_id: &str, url: &str) -> Result<Issue, IssueError> {
    let url = url.trim().to_string();
    modify_issue(ctx, issue_id, |issue| {
        issue.add_pr(&url);
        Ok(())
    })
}

pub fn remove_pr(ctx: &StoreContext, issue_id: &str, url: &str) -> Result<Issue, IssueError> {
    let url = url.trim().to_string();
    modify_issue(ctx, issue_id, |issue| {
        issue.remove_pr(&url);
        Ok(())
    })
}

pub fn view_issue(ctx: &StoreContext, issue_id: &str) -> Result<Issue, IssueError> {
    let key = project_of(issue_id)?;
    let path = issue_path(ctx, &key, issue_id)?;
    match storage::read::<Issue>(&path) {
        Ok(issue) => Ok(issue),
        Err(err) if err.is_not_found() => Err(IssueError::NotFound(issue_id.to_string())),
        Err(err) => Err(err.into()),
    }
}

/// Indexed issues whose record lists `issue_id` in `blocked_by`.
/// Unreadable records are ignored.
pub fn find_dependents(ctx: &StoreContext, issue_id: &str) -> Result<Vec<String>, IssueError> {
    let key = project_of(issue_id)?;
    let index = project::load_index(ctx, &key)?;
    let mut dependents = Vec::new();
    for entry in &index.issues {
        let Ok(path) = issue_path(ctx, &key, &entry.id) else {
            continue;
        };
        let Ok(issue) = storage::read::<Issue>(&path) else {
            continue;
        };
        if issue.blocked_by.iter().any(|id| id == issue_id) {
            dependents.push(entry.id.clone());
        }
    }
    Ok(dependents)
}

/// Deletes the issue file, then drops it from the index. A failed index
/// update does not undo the deletion; it is reported and `project repair`
/// fixes it.
pub fn delete_issue(ctx: &StoreContext, issue_id: &str) -> Result<DeletedIssue, IssueError> {
    let key = project_of(issue_id)?;
    ensure_issue(ctx, &key, issue_id)?;
    let (dependents, dependents_warning) = match find_dependents(ctx, issue_id) {
        Ok(dependents) => (dependents, None),
        Err(err) => {
            warn!(project = %key, id = issue_id, error = %err, "could not check dependents");
            (Vec::new(), Some(err.to_string()))
        }
    };

    let path = issue_path(ctx, &key, issue_id)?;
    match storage::delete_record(ctx, &path) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Err(IssueError::NotFound(issue_id.to_string())),
        Err(err) => return Err(err.into()),
    }

    let index_path = project_index_path(ctx, &key)?;
    let index_warning = storage::update_in_place_from(
        ctx,
        &index_path,
        ProjectIndex::new(&key, None),
        |index: &mut ProjectIndex| {
            index.remove_issue(issue_id);
            index.touch();
            Ok::<(), StorageError>(())
        },
    )
    .err()
    .map(|err| err.to_string());
    debug!(project = %key, id = issue_id, "deleted issue");

    Ok(DeletedIssue {
        id: issue_id.to_string(),
        dependents,
        index_warning,
        dependents_warning,
    })
}

/// Loads every indexed issue that passes `filter`. Records that cannot be
/// read are skipped and reported in `warnings`.
pub fn list_issues(
    ctx: &StoreContext,
    project_key: &str,
    filter: &IssueFilter,
) -> Result<IssueListing, IssueError> {
    let index = project::load_index(ctx, project_key)?;
    let mut listing = IssueListing::default();
    for entry in &index.issues {
        if filter.status.is_some_and(|status| status != entry.status) {
            continue;
        }
        if let Some(epic_id) = filter.epic_id.as_deref() {
            if entry.epic_id.as_deref() != Some(epic_id) {
                continue;
            }
        }
        let loaded = issue_path(ctx, project_key, &entry.id)
            .and_then(|path| storage::read::<Issue>(&path));
        match loaded {
            Ok(issue) => listing.issues.push(issue),
            Err(err) => listing.warnings.push(format!("{}: {err}", entry.id)),
        }
    }
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Epic;
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

    fn titled(title: &str) -> NewIssue {
        NewIssue {
            title: title.to_string(),
            ..NewIssue::default()
        }
    }

    #[test]
    fn create_assigns_sequential_ids_and_indexes() {
        let (_temp, ctx) = setup();
        let first = create_issue(&ctx, "CORE", titled("First")).expect("first");
        let second = create_issue(&ctx, "CORE", titled("Second")).expect("second");
        assert_eq!(first.id, "CORE-1");
        assert_eq!(second.id, "CORE-2");

        let index = project::load_index(&ctx, "CORE").expect("index");
        assert_eq!(index.issues.len(), 2);
        assert_eq!(index.find_issue("CORE-2").map(|e| e.title.as_str()), Some("Second"));
    }

    #[test]
    fn create_skips_ids_taken_outside_the_index() {
        let (_temp, ctx) = setup();
        let path = issue_path(&ctx, "CORE", "CORE-1").expect("path");
        let stray = Issue {
            id: "CORE-1".to_string(),
            title: "Stray".to_string(),
            ..Issue::default()
        };
        storage::write_unconditional(&ctx, &path, &stray).expect("stray");

        let issue = create_issue(&ctx, "CORE", titled("Next")).expect("create");
        assert_eq!(issue.id, "CORE-2");
        assert_eq!(view_issue(&ctx, "CORE-1").expect("stray kept").title, "Stray");
    }

    #[test]
    fn create_validates_input() {
        let (_temp, ctx) = setup();
        assert!(matches!(
            create_issue(&ctx, "CORE", titled("  ")),
            Err(IssueError::Model(ModelError::MissingTitle))
        ));
        assert!(matches!(
            create_issue(&ctx, "NOPE", titled("x")),
            Err(IssueError::Project(ProjectError::NotFound(_)))
        ));
        let foreign = NewIssue {
            id: Some("WEB-1".to_string()),
            ..titled("x")
        };
        assert!(matches!(
            create_issue(&ctx, "CORE", foreign),
            Err(IssueError::KeyMismatch { .. })
        ));
        let missing_epic = NewIssue {
            epic_id: Some("E-9".to_string()),
            ..titled("x")
        };
        assert!(matches!(
            create_issue(&ctx, "CORE", missing_epic),
            Err(IssueError::EpicNotFound(_))
        ));
    }

    #[test]
    fn explicit_id_must_be_free() {
        let (_temp, ctx) = setup();
        let explicit = NewIssue {
            id: Some("CORE-42".to_string()),
            ..titled("Answer")
        };
        create_issue(&ctx, "CORE", explicit.clone()).expect("create");
        assert!(matches!(
            create_issue(&ctx, "CORE", explicit),
            Err(IssueError::AlreadyExists(_))
        ));
        assert_eq!(next_issue_sequence(&ctx, "CORE").expect("next"), 43);
    }

    #[test]
    fn update_patches_fields_and_index() {
        let (_temp, ctx) = setup();
        let epic = Epic {
            id: "E-1".to_string(),
            title: "Epic".to_string(),
            ..Epic::default()
        };
        let epic_file = epic_path(&ctx, "CORE", "E-1").expect("path");
        storage::write_unconditional(&ctx, &epic_file, &epic).expect("epic");
        create_issue(&ctx, "CORE", titled("Draft")).expect("create");

        let patch = IssuePatch {
            title: Some("Final".to_string()),
            status: Some(Status::Doing),
            priority: Some(Priority::High),
            epic_id: Some("E-1".to_string()),
            ..IssuePatch::default()
        };
        let updated = update_issue(&ctx, "CORE-1", patch).expect("update");
        assert_eq!(updated.title, "Final");
        assert_eq!(updated.status, Status::Doing);
        assert_eq!(updated.epic_id.as_deref(), Some("E-1"));

        let index = project::load_index(&ctx, "CORE").expect("index");
        let entry = index.find_issue("CORE-1").expect("entry");
        assert_eq!(entry.status, Status::Doing);
        assert_eq!(entry.epic_id.as_deref(), Some("E-1"));

        let detach = IssuePatch {
            epic_id: Some(String::new()),
            ..IssuePatch::default()
        };
        assert_eq!(update_issue(&ctx, "CORE-1", detach).expect("detach").epic_id, None);
    }

    #[test]
    fn update_rejects_blank_title_and_missing_issue() {
        let (_temp, ctx) = setup();
        create_issue(&ctx, "CORE", titled("Keep")).expect("create");
        let blank = IssuePatch {
            title: Some(" ".to_string()),
            ..IssuePatch::default()
        };
        assert!(matches!(
            update_issue(&ctx, "CORE-1", blank),
            Err(IssueError::Model(ModelError::MissingTitle))
        ));
        assert_eq!(view_issue(&ctx, "CORE-1").expect("view").title, "Keep");
        assert!(matches!(
            update_issue(&ctx, "CORE-9", IssuePatch::default()),
            Err(IssueError::NotFound(_))
        ));
    }

    #[test]
    fn link_and_pr_management() {
        let (_temp, ctx) = setup();
        create_issue(&ctx, "CORE", titled("A")).expect("a");
        create_issue(&ctx, "CORE", titled("B")).expect("b");

        let linked = link_issue(&ctx, "CORE-2", "CORE-1", false).expect("link");
        assert_eq!(linked.blocked_by, vec!["CORE-1".to_string()]);
        assert!(matches!(
            link_issue(&ctx, "CORE-2", "CORE-7", false),
            Err(IssueError::DependencyNotFound(_))
        ));
        assert!(matches!(
            link_issue(&ctx, "CORE-2", "CORE-2", false),
            Err(IssueError::SelfDependency(_))
        ));
        assert_eq!(find_dependents(&ctx, "CORE-1").expect("deps"), vec!["CORE-2"]);
        assert!(unlink_issue(&ctx, "CORE-2", "CORE-1").expect("unlink").blocked_by.is_empty());

        let with_pr = add_pr(&ctx, "CORE-1", "https://example.test/pr/7").expect("pr");
        assert_eq!(with_pr.prs.len(), 1);
        assert!(remove_pr(&ctx, "CORE-1", "https://example.test/pr/7").expect("rm").prs.is_empty());
    }

    #[test]
    fn create_stops_at_the_largest_sequence() {
        let (_temp, ctx) = setup();
        let explicit = NewIssue {
            id: Some("CORE-18446744073709551614".to_string()),
            ..titled("Near the end")
        };
        create_issue(&ctx, "CORE", explicit).expect("explicit");

        let last = create_issue(&ctx, "CORE", titled("Last")).expect("last");
        assert_eq!(last.id, "CORE-18446744073709551615");
        assert!(matches!(
            create_issue(&ctx, "CORE", titled("Overflow")),
            Err(IssueError::SequenceExhausted(_))
        ));
        assert_eq!(project::load_index(&ctx, "CORE").expect("index").issues.len(), 2);
    }

    #[test]
    fn delete_warns_when_dependents_cannot_be_checked() {
        let (_temp, ctx) = setup();
        create_issue(&ctx, "CORE", titled("A")).expect("a");
        let index = project_index_path(&ctx, "CORE").expect("index");
        fs::write(index.path(), "{oops").expect("corrupt");

        let deleted = delete_issue(&ctx, "CORE-1").expect("delete");
        assert!(deleted.dependents.is_empty());
        assert!(deleted.dependents_warning.is_some());
        assert!(deleted.index_warning.is_some());
        assert!(!issue_path(&ctx, "CORE", "CORE-1").expect("path").path().exists());
    }

    #[test]
    fn delete_reports_dependents_and_updates_index() {
        let (_temp, ctx) = setup();
        create_issue(&ctx, "CORE", titled("A")).expect("a");
        create_issue(&ctx, "CORE", titled("B")).expect("b");
        link_issue(&ctx, "CORE-2", "CORE-1", false).expect("link");

        let deleted = delete_issue(&ctx, "CORE-1").expect("delete");
        assert_eq!(deleted.dependents, vec!["CORE-2".to_string()]);
        assert!(deleted.index_warning.is_none());
        assert!(deleted.dependents_warning.is_none());
        assert!(matches!(view_issue(&ctx, "CORE-1"), Err(IssueError::NotFound(_))));
        let index = project::load_index(&ctx, "CORE").expect("index");
        assert!(index.find_issue("CORE-1").is_none());
        assert!(matches!(delete_issue(&ctx, "CORE-1"), Err(IssueError::NotFound(_))));
    }

    #[test]
    fn list_filters_and_reports_unreadable() {
        let (_temp, ctx) = setup();
        create_issue(&ctx, "CORE", titled("A")).expect("a");
        create_issue(&ctx, "CORE", titled("B")).expect("b");
        create_issue(&ctx, "CORE", titled("C")).expect("c");
        let done = IssuePatch {
            status: Some(Status::Done),
            ..IssuePatch::default()
        };
        update_issue(&ctx, "CORE-2", done).expect("done");
        let broken = issue_path(&ctx, "CORE", "CORE-3").expect("path");
        fs::write(broken.path(), "not json").expect("corrupt");

        let all = list_issues(&ctx, "CORE", &IssueFilter::default()).expect("list");
        assert_eq!(all.issues.len(), 2);
        assert_eq!(all.warnings.len(), 1);

        let filter = IssueFilter {
            status: Some(Status::Done),
            ..IssueFilter::default()
        };
        let done = list_issues(&ctx, "CORE", &filter).expect("done");
        assert_eq!(done.issues.len(), 1);
        assert_eq!(done.issues[0].id, "CORE-2");
    }

    #[test]
    fn traversal_ids_never_leave_the_store() {
        let (temp, ctx) = setup();
        assert!(view_issue(&ctx, "../../etc/passwd-1").is_err());
        assert!(delete_issue(&ctx, "CORE/../../x-1").is_err());
        assert!(!temp.path().join("x-1.json").exists());
    }
}
