use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::context::StoreContext;

use super::atomic::write_atomic;
use super::lock::acquire_lock;
use super::paths::{collection_dir, Collection, RecordPath};
use super::transaction::begin_transaction;
use super::StorageError;

/// Reads and decodes a record. Takes no lock.
pub fn read<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, StorageError> {
    let path = path.as_ref();
    read_optional(path)?.ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
}

/// Like [`read`], but a missing file is `Ok(None)`.
pub fn read_optional<T: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<Option<T>, StorageError> {
    let path = path.as_ref();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StorageError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Indented JSON with a trailing newline, the on-disk record format.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(StorageError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Overwrites the record under the project lock.
pub fn write_unconditional<T: Serialize + ?Sized>(
    ctx: &StoreContext,
    path: &RecordPath,
    record: &T,
) -> Result<(), StorageError> {
    with_project_lock(ctx, path, "write_json", || {
        let bytes = to_pretty_json(record)?;
        write_atomic(path.path(), &bytes)
    })
}

/// Writes the record only if nothing is stored at `path`.
///
/// The existence check runs while the lock is held, so of several racing
/// creators exactly one wins and the rest see `AlreadyExists`.
pub fn create_if_absent<T: Serialize + ?Sized>(
    ctx: &StoreContext,
    path: &RecordPath,
    record: &T,
) -> Result<(), StorageError> {
    with_project_lock(ctx, path, "create_json", || {
        if path.path().try_exists()? {
            return Err(StorageError::AlreadyExists(path.path().to_path_buf()));
        }
        let bytes = to_pretty_json(record)?;
        write_atomic(path.path(), &bytes)
    })
}

/// Read-modify-write under one lock acquisition, starting from
/// `T::default()` when the record does not exist yet.
pub fn update_in_place<T, E, F>(ctx: &StoreContext, path: &RecordPath, mutate: F) -> Result<T, E>
where
    T: Serialize + DeserializeOwned + Default,
    E: From<StorageError>,
    F: FnOnce(&mut T) -> Result<(), E>,
{
    update_in_place_from(ctx, path, T::default(), mutate)
}

/// Read-modify-write under one lock acquisition, starting from `zero` when
/// the record does not exist yet.
///
/// An error from `mutate` aborts the operation and leaves the file as it
/// was. Returns the value that was stored.
pub fn update_in_place_from<T, E, F>(
    ctx: &StoreContext,
    path: &RecordPath,
    zero: T,
    mutate: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    E: From<StorageError>,
    F: FnOnce(&mut T) -> Result<(), E>,
{
    with_project_lock(ctx, path, "update_json", || {
        let mut value = read_optional::<T>(path.path())?.unwrap_or(zero);
        mutate(&mut value)?;
        let bytes = to_pretty_json(&value)?;
        write_atomic(path.path(), &bytes)?;
        Ok(value)
    })
}

/// Removes the record under the project lock.
pub fn delete_record(ctx: &StoreContext, path: &RecordPath) -> Result<(), StorageError> {
    with_project_lock(ctx, path, "delete_json", || match fs::remove_file(path.path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(StorageError::NotFound(path.path().to_path_buf()))
        }
        Err(err) => Err(err.into()),
    })
}

/// Ids of the records stored in one collection, sorted. A missing
/// collection directory lists as empty; temp files are skipped.
pub fn list_record_ids(
    ctx: &StoreContext,
    project_key: &str,
    collection: Collection,
) -> Result<Vec<String>, StorageError> {
    let dir = collection_dir(ctx, project_key, collection)?;
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(id) = name.strip_suffix(".json") {
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Runs `body` as one critical section: lock, marker, body, commit,
/// release. On any failure the guards clear the marker and the lock.
fn with_project_lock<R, E>(
    ctx: &StoreContext,
    path: &RecordPath,
    operation: &str,
    body: impl FnOnce() -> Result<R, E>,
) -> Result<R, E>
where
    E: From<StorageError>,
{
    let lock = acquire_lock(ctx, path.project())?;
    let tx = begin_transaction(ctx, path.project(), operation, file_metadata(path))?;
    let value = body()?;
    tx.commit()?;
    lock.release()?;
    Ok(value)
}

fn file_metadata(path: &RecordPath) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "file".to_string(),
        Value::String(path.path().to_string_lossy().to_string()),
    );
    metadata
}
