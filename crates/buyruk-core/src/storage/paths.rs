use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::context::StoreContext;

use super::StorageError;

pub const PROJECTS_DIR: &str = "projects";
pub const CONFIG_FILE: &str = "config.json";
pub const INDEX_FILE: &str = "project.json";
pub const ISSUES_DIR: &str = "issues";
pub const EPICS_DIR: &str = "epics";
pub const LOCK_FILE: &str = ".lock";
pub const PENDING_FILE: &str = ".pending";
pub const TEMP_SUFFIX: &str = ".tmp";
const RECORD_EXT: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Issues,
    Epics,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Issues, Collection::Epics];

    pub fn dir_name(self) -> &'static str {
        match self {
            Collection::Issues => ISSUES_DIR,
            Collection::Epics => EPICS_DIR,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A validated on-disk record location together with the project whose
/// lock guards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPath {
    project: String,
    path: PathBuf,
}

impl RecordPath {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for RecordPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

pub fn projects_dir(ctx: &StoreContext) -> PathBuf {
    ctx.base_dir().join(PROJECTS_DIR)
}

pub fn config_path(ctx: &StoreContext) -> PathBuf {
    ctx.base_dir().join(CONFIG_FILE)
}

pub fn project_dir(ctx: &StoreContext, project_key: &str) -> Result<PathBuf, StorageError> {
    contained_join(&projects_dir(ctx), project_key, "")
}

pub fn project_index_path(
    ctx: &StoreContext,
    project_key: &str,
) -> Result<RecordPath, StorageError> {
    Ok(RecordPath {
        project: project_key.to_string(),
        path: project_dir(ctx, project_key)?.join(INDEX_FILE),
    })
}

pub fn collection_dir(
    ctx: &StoreContext,
    project_key: &str,
    collection: Collection,
) -> Result<PathBuf, StorageError> {
    Ok(project_dir(ctx, project_key)?.join(collection.dir_name()))
}

pub fn record_path(
    ctx: &StoreContext,
    project_key: &str,
    collection: Collection,
    record_id: &str,
) -> Result<RecordPath, StorageError> {
    let dir = collection_dir(ctx, project_key, collection)?;
    Ok(RecordPath {
        project: project_key.to_string(),
        path: contained_join(&dir, record_id, RECORD_EXT)?,
    })
}

pub fn issue_path(
    ctx: &StoreContext,
    project_key: &str,
    issue_id: &str,
) -> Result<RecordPath, StorageError> {
    record_path(ctx, project_key, Collection::Issues, issue_id)
}

pub fn epic_path(
    ctx: &StoreContext,
    project_key: &str,
    epic_id: &str,
) -> Result<RecordPath, StorageError> {
    record_path(ctx, project_key, Collection::Epics, epic_id)
}

pub fn lock_path(ctx: &StoreContext, project_key: &str) -> Result<PathBuf, StorageError> {
    Ok(project_dir(ctx, project_key)?.join(LOCK_FILE))
}

pub fn pending_path(ctx: &StoreContext, project_key: &str) -> Result<PathBuf, StorageError> {
    Ok(project_dir(ctx, project_key)?.join(PENDING_FILE))
}

/// Resolves the index record of a project, or a record inside one of its
/// collections when `record` is given.
pub fn resolve_path(
    ctx: &StoreContext,
    project_key: &str,
    record: Option<(Collection, &str)>,
) -> Result<RecordPath, StorageError> {
    match record {
        Some((collection, record_id)) => record_path(ctx, project_key, collection, record_id),
        None => project_index_path(ctx, project_key),
    }
}

/// Joins `segment + suffix` onto `dir`, rejecting any segment that is not
/// a single plain path component or that lands outside `dir`.
fn contained_join(dir: &Path, segment: &str, suffix: &str) -> Result<PathBuf, StorageError> {
    if segment.is_empty() {
        return Err(StorageError::invalid(segment, "identifier is empty"));
    }
    if segment.contains('\0') {
        return Err(StorageError::invalid(segment, "identifier contains a NUL byte"));
    }
    if Path::new(segment).is_absolute() || segment.starts_with('/') || segment.starts_with('\\') {
        return Err(StorageError::invalid(segment, "identifier is an absolute path"));
    }
    if clean(Path::new(segment)).as_os_str() != OsStr::new(segment) {
        return Err(StorageError::invalid(segment, "identifier is not in normal form"));
    }
    if segment.contains('/')
        || segment.contains('\\')
        || segment.contains(std::path::MAIN_SEPARATOR)
    {
        return Err(StorageError::invalid(segment, "identifier contains a path separator"));
    }
    if segment == "." || segment == ".." {
        return Err(StorageError::invalid(segment, "identifier is a directory reference"));
    }

    let mut name = OsString::from(segment);
    name.push(suffix);
    let candidate = dir.join(name);

    let relative = relative_to(dir, &candidate);
    match relative.components().next() {
        Some(Component::Normal(_)) => Ok(candidate),
        _ => Err(StorageError::invalid(segment, "identifier escapes its directory")),
    }
}

/// Lexical cleanup: drops `.` components and redundant separators, and
/// folds `name/..` pairs. `..` above a root is discarded.
pub(crate) fn clean(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// Lexical relative path from `base` to `target`, both cleaned first.
pub(crate) fn relative_to(base: &Path, target: &Path) -> PathBuf {
    let base = clean(base);
    let target = clean(target);
    let base_parts: Vec<Component<'_>> = base.components().collect();
    let target_parts: Vec<Component<'_>> = target.components().collect();

    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}
