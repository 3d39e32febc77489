use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub const HOME_ENV: &str = "BUYRUK_HOME";
pub const APP_DIR: &str = "buyruk";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Unable to resolve a config directory; set {HOME_ENV} to an absolute path")]
    NoHome,
    #[error("Failed to resolve working directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved location of the store plus the lock policy used against it.
///
/// Built once at process start and passed by reference into every storage
/// call.
#[derive(Debug, Clone)]
pub struct StoreContext {
    base_dir: PathBuf,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl StoreContext {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Resolves the base directory from an explicit override, then
    /// `BUYRUK_HOME`, then the platform config directory.
    pub fn from_env(override_dir: Option<&Path>) -> Result<Self, ContextError> {
        let base = match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => resolve_base_dir().ok_or(ContextError::NoHome)?,
        };
        let base = if base.is_absolute() {
            base
        } else {
            std::env::current_dir()?.join(base)
        };
        Ok(Self::new(base))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

fn non_empty_env(name: &str) -> Option<PathBuf> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

pub fn resolve_base_dir() -> Option<PathBuf> {
    if let Some(home) = non_empty_env(HOME_ENV) {
        return Some(home);
    }
    if let Some(config) = non_empty_env("XDG_CONFIG_HOME") {
        return Some(config.join(APP_DIR));
    }
    if cfg!(windows) {
        if let Some(appdata) = non_empty_env("APPDATA") {
            return Some(appdata.join(APP_DIR));
        }
    }
    if let Some(home) = non_empty_env("HOME") {
        return Some(home.join(".config").join(APP_DIR));
    }
    non_empty_env("USERPROFILE").map(|profile| profile.join(".config").join(APP_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::ffi::OsString;

    struct EnvGuard {
        saved: Vec<(&'static str, Option<OsString>)>,
    }

    impl EnvGuard {
        fn capture(names: &[&'static str]) -> Self {
            Self {
                saved: names
                    .iter()
                    .map(|name| (*name, std::env::var_os(name)))
                    .collect(),
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(value) => std::env::set_var(name, value),
                    None => std::env::remove_var(name),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn buyruk_home_wins_over_xdg() {
        let _env = EnvGuard::capture(&[HOME_ENV, "XDG_CONFIG_HOME"]);
        std::env::set_var(HOME_ENV, "/tmp/buyruk-home");
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg");
        assert_eq!(resolve_base_dir(), Some(PathBuf::from("/tmp/buyruk-home")));
    }

    #[test]
    #[serial]
    fn xdg_config_home_gets_app_dir() {
        let _env = EnvGuard::capture(&[HOME_ENV, "XDG_CONFIG_HOME"]);
        std::env::remove_var(HOME_ENV);
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg");
        assert_eq!(resolve_base_dir(), Some(PathBuf::from("/tmp/xdg/buyruk")));
    }

    #[test]
    #[serial]
    fn blank_override_env_is_ignored() {
        let _env = EnvGuard::capture(&[HOME_ENV, "XDG_CONFIG_HOME"]);
        std::env::set_var(HOME_ENV, "   ");
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg");
        assert_eq!(resolve_base_dir(), Some(PathBuf::from("/tmp/xdg/buyruk")));
    }

    #[test]
    fn explicit_override_is_made_absolute() {
        let ctx = StoreContext::from_env(Some(Path::new("relative-home"))).expect("ctx");
        assert!(ctx.base_dir().is_absolute());
        assert!(ctx.base_dir().ends_with("relative-home"));
        assert_eq!(ctx.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(ctx.poll_interval(), DEFAULT_POLL_INTERVAL);
    }
}
