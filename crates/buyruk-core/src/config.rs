use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::StoreContext;
use crate::models::is_valid_project_key;
use crate::storage::{self, StorageError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Unknown config key {0:?} (expected default_project or default_format)")]
    UnknownKey(String),
    #[error(
        "Invalid project key {0:?} (must contain only uppercase letters, numbers, and hyphens)"
    )]
    InvalidProject(String),
    #[error("Invalid format {0:?} (expected modern, json, or csv)")]
    InvalidFormat(String),
    #[error("No project specified (use --project or set default_project)")]
    NoProject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Modern,
    Json,
    Csv,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Modern => "modern",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "modern" => Ok(OutputFormat::Modern),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(ConfigError::InvalidFormat(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuyrukConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_format: Option<OutputFormat>,
}

impl BuyrukConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(project) = self.default_project.as_deref() {
            if !is_valid_project_key(project) {
                return Err(ConfigError::InvalidProject(project.to_string()));
            }
        }
        Ok(())
    }
}

pub const CONFIG_KEYS: [&str; 2] = ["default_project", "default_format"];

pub fn config_path(ctx: &StoreContext) -> PathBuf {
    storage::config_path(ctx)
}

/// Loads `config.json`, falling back to defaults when it does not exist.
pub fn load_config(ctx: &StoreContext) -> Result<BuyrukConfig, ConfigError> {
    let config = storage::read_optional::<BuyrukConfig>(config_path(ctx))?.unwrap_or_default();
    config.validate()?;
    Ok(config)
}

/// Config lives outside every project, so it is written atomically but
/// without a project lock.
pub fn save_config(ctx: &StoreContext, config: &BuyrukConfig) -> Result<PathBuf, ConfigError> {
    config.validate()?;
    let path = config_path(ctx);
    let bytes = storage::to_pretty_json(config)?;
    storage::write_atomic(&path, &bytes)?;
    Ok(path)
}

pub fn get_value(ctx: &StoreContext, key: &str) -> Result<Option<String>, ConfigError> {
    let config = load_config(ctx)?;
    match key {
        "default_project" => Ok(config.default_project),
        "default_format" => Ok(config.default_format.map(|format| format.to_string())),
        _ => Err(ConfigError::UnknownKey(key.to_string())),
    }
}

/// Sets one key. An empty value clears it.
pub fn set_value(ctx: &StoreContext, key: &str, value: &str) -> Result<BuyrukConfig, ConfigError> {
    let mut config = load_config(ctx)?;
    let value = value.trim();
    match key {
        "default_project" => {
            if !value.is_empty() && !is_valid_project_key(value) {
                return Err(ConfigError::InvalidProject(value.to_string()));
            }
            config.default_project = (!value.is_empty()).then(|| value.to_string());
        }
        "default_format" => {
            config.default_format = if value.is_empty() {
                None
            } else {
                Some(value.parse()?)
            };
        }
        _ => return Err(ConfigError::UnknownKey(key.to_string())),
    }
    save_config(ctx, &config)?;
    Ok(config)
}

/// Project precedence: explicit flag, then `default_project`.
pub fn resolve_project(ctx: &StoreContext, flag: Option<&str>) -> Result<String, ConfigError> {
    if let Some(project) = flag.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(project.to_string());
    }
    load_config(ctx)?
        .default_project
        .ok_or(ConfigError::NoProject)
}

pub fn resolve_format_with_source(
    ctx: &StoreContext,
    flag: Option<&str>,
) -> Result<(OutputFormat, &'static str), ConfigError> {
    if let Some(format) = flag.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok((format.parse()?, "flag"));
    }
    // An unreadable config file should not stop read-only output.
    if let Ok(Some(format)) = load_config(ctx).map(|config| config.default_format) {
        return Ok((format, "config"));
    }
    Ok((OutputFormat::default(), "default"))
}

pub fn resolve_format(ctx: &StoreContext, flag: Option<&str>) -> Result<OutputFormat, ConfigError> {
    resolve_format_with_source(ctx, flag).map(|(format, _)| format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_loads_defaults() {
        let temp = TempDir::new().expect("tempdir");
        let ctx = StoreContext::new(temp.path());
        assert_eq!(load_config(&ctx).expect("load"), BuyrukConfig::default());
    }

    #[test]
    fn set_and_get_values() {
        let temp = TempDir::new().expect("tempdir");
        let ctx = StoreContext::new(temp.path());

        set_value(&ctx, "default_project", "CORE").expect("set project");
        set_value(&ctx, "default_format", "json").expect("set format");
        assert_eq!(
            get_value(&ctx, "default_project").expect("get"),
            Some("CORE".to_string())
        );
        assert_eq!(
            get_value(&ctx, "default_format").expect("get"),
            Some("json".to_string())
        );
        assert!(config_path(&ctx).is_file());

        set_value(&ctx, "default_project", "").expect("clear");
        assert_eq!(get_value(&ctx, "default_project").expect("get"), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let ctx = StoreContext::new(temp.path());
        assert!(matches!(
            set_value(&ctx, "default_project", "lower"),
            Err(ConfigError::InvalidProject(_))
        ));
        assert!(matches!(
            set_value(&ctx, "default_format", "yaml"),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(matches!(
            set_value(&ctx, "colour", "red"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(!config_path(&ctx).exists());
    }

    #[test]
    fn resolution_prefers_flag_then_config_then_default() {
        let temp = TempDir::new().expect("tempdir");
        let ctx = StoreContext::new(temp.path());

        assert!(matches!(resolve_project(&ctx, None), Err(ConfigError::NoProject)));
        assert_eq!(
            resolve_format_with_source(&ctx, None).expect("format"),
            (OutputFormat::Modern, "default")
        );

        set_value(&ctx, "default_project", "CORE").expect("set");
        set_value(&ctx, "default_format", "csv").expect("set");
        assert_eq!(resolve_project(&ctx, None).expect("project"), "CORE");
        assert_eq!(
            resolve_format_with_source(&ctx, None).expect("format"),
            (OutputFormat::Csv, "config")
        );

        assert_eq!(resolve_project(&ctx, Some("WEB")).expect("project"), "WEB");
        assert_eq!(
            resolve_format_with_source(&ctx, Some("json")).expect("format"),
            (OutputFormat::Json, "flag")
        );
    }
}
