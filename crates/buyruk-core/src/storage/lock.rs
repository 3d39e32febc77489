use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::StoreContext;

use super::paths::{lock_path, project_dir, LOCK_FILE};
use super::StorageError;

/// Exclusive hold on a project's lock file.
///
/// The file is deleted by [`LockGuard::release`] or, failing that, when
/// the guard is dropped. Release never checks who created the file.
#[derive(Debug)]
pub struct LockGuard {
    project: String,
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        remove_lock_file(&self.path)?;
        debug!(project = %self.project, "released project lock");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_lock_file(&self.path) {
            debug!(project = %self.project, error = %err, "failed to remove lock file on drop");
        } else {
            debug!(project = %self.project, "released project lock on drop");
        }
    }
}

fn remove_lock_file(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        // The project directory may have been removed while the lock was held.
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Acquires the project lock, polling until the context's lock timeout.
///
/// Creation of the lock file with create-new semantics is the test-and-set:
/// exactly one caller can create it. The project directory is created
/// first so a project that does not exist yet can still be locked.
pub fn acquire_lock(ctx: &StoreContext, project_key: &str) -> Result<LockGuard, StorageError> {
    let dir = project_dir(ctx, project_key)?;
    fs::create_dir_all(&dir)?;
    let path = dir.join(LOCK_FILE);

    let timeout = ctx.lock_timeout();
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let written = write!(file, "{}", std::process::id()).and_then(|_| file.sync_all());
                drop(file);
                if let Err(err) = written {
                    let _ = fs::remove_file(&path);
                    return Err(err.into());
                }
                debug!(project = project_key, attempts, "acquired project lock");
                return Ok(LockGuard {
                    project: project_key.to_string(),
                    path,
                    released: false,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StorageError::LockTimeout {
                        project: project_key.to_string(),
                        timeout,
                    });
                }
                thread::sleep(ctx.poll_interval().min(deadline - now));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Reports whether a lock file is present, without taking it.
pub fn check_lock(ctx: &StoreContext, project_key: &str) -> Result<bool, StorageError> {
    let path = lock_path(ctx, project_key)?;
    Ok(path.try_exists()?)
}

/// Process id recorded by the current holder, if any. Diagnostic only.
pub fn read_lock_holder(
    ctx: &StoreContext,
    project_key: &str,
) -> Result<Option<u32>, StorageError> {
    let path = lock_path(ctx, project_key)?;
    match fs::read_to_string(&path) {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Waits until the lock is absent without acquiring it.
pub fn wait_for_lock(
    ctx: &StoreContext,
    project_key: &str,
    timeout: Duration,
) -> Result<(), StorageError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !check_lock(ctx, project_key)? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(StorageError::LockTimeout {
                project: project_key.to_string(),
                timeout,
            });
        }
        thread::sleep(ctx.poll_interval().min(deadline - now));
    }
}
