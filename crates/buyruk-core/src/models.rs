use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Issue title is required")]
    MissingTitle,
    #[error("Epic id is required")]
    MissingEpicId,
    #[error("Project key is required")]
    MissingProjectKey,
    #[error(
        "Invalid project key {0:?} (must contain only uppercase letters, numbers, and hyphens)"
    )]
    InvalidProjectKey(String),
    #[error("Invalid status {0:?} (expected TODO, DOING, or DONE)")]
    InvalidStatus(String),
    #[error("Invalid priority {0:?} (expected LOW, MEDIUM, HIGH, or CRITICAL)")]
    InvalidPriority(String),
    #[error("Invalid type {0:?} (expected task, bug, or epic)")]
    InvalidType(String),
    #[error("Invalid issue id {0:?} (expected <PROJECT>-<number>)")]
    InvalidIssueId(String),
    #[error("Invalid record id {0:?} (only letters, numbers, and hyphens are allowed)")]
    InvalidRecordId(String),
    #[error("Index entry {0} has an empty id")]
    EmptyIndexEntry(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    #[serde(rename = "TODO")]
    Todo,
    #[serde(rename = "DOING")]
    Doing,
    #[serde(rename = "DONE")]
    Done,
}

impl Status {
    pub const ALL: [Status; 3] = [Status::Todo, Status::Doing, Status::Done];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "TODO",
            Status::Doing => "DOING",
            Status::Done => "DONE",
        }
    }
}

impl FromStr for Status {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "TODO" => Ok(Status::Todo),
            "DOING" => Ok(Status::Doing),
            "DONE" => Ok(Status::Done),
            _ => Err(ModelError::InvalidStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Priority {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            _ => Err(ModelError::InvalidPriority(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    #[default]
    Task,
    Bug,
    Epic,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::Task => "task",
            IssueType::Bug => "bug",
            IssueType::Epic => "epic",
        }
    }
}

impl FromStr for IssueType {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "task" => Ok(IssueType::Task),
            "bug" => Ok(IssueType::Bug),
            "epic" => Ok(IssueType::Epic),
            _ => Err(ModelError::InvalidType(value.to_string())),
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(Status, Priority, IssueType);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(rename = "type", default)]
    pub issue_type: IssueType,
    pub title: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Issue {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.title.trim().is_empty() {
            return Err(ModelError::MissingTitle);
        }
        Ok(())
    }

    pub fn add_dependency(&mut self, issue_id: &str) {
        push_unique(&mut self.blocked_by, issue_id);
    }

    pub fn remove_dependency(&mut self, issue_id: &str) {
        self.blocked_by.retain(|id| id != issue_id);
    }

    pub fn add_pr(&mut self, url: &str) {
        push_unique(&mut self.prs, url);
    }

    pub fn remove_pr(&mut self, url: &str) {
        self.prs.retain(|pr| pr != url);
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(now_rfc3339());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Epic {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.id.trim().is_empty() {
            return Err(ModelError::MissingEpicId);
        }
        validate_record_id(&self.id)?;
        if self.title.trim().is_empty() {
            return Err(ModelError::MissingTitle);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    pub status: Status,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
}

impl From<&Issue> for IndexEntry {
    fn from(issue: &Issue) -> Self {
        Self {
            id: issue.id.clone(),
            title: issue.title.clone(),
            status: issue.status,
            issue_type: issue.issue_type,
            epic_id: issue.epic_id.clone(),
        }
    }
}

/// `project.json`: the per-project summary of every issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectIndex {
    pub project_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default)]
    pub issues: Vec<IndexEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ProjectIndex {
    pub fn new(project_key: &str, project_name: Option<&str>) -> Self {
        let now = now_rfc3339();
        Self {
            project_key: project_key.to_string(),
            project_name: project_name.map(str::to_string),
            issues: Vec::new(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        }
    }

    /// Inserts or replaces the entry for `issue.id`.
    pub fn add_issue(&mut self, issue: &Issue) {
        self.remove_issue(&issue.id);
        self.issues.push(IndexEntry::from(issue));
    }

    pub fn remove_issue(&mut self, issue_id: &str) {
        self.issues.retain(|entry| entry.id != issue_id);
    }

    pub fn find_issue(&self, issue_id: &str) -> Option<&IndexEntry> {
        self.issues.iter().find(|entry| entry.id == issue_id)
    }

    /// Highest numeric suffix among indexed issue ids.
    pub fn max_sequence(&self) -> u64 {
        self.issues
            .iter()
            .filter_map(|entry| parse_issue_id(&entry.id).ok())
            .map(|(_, seq)| seq)
            .max()
            .unwrap_or(0)
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(now_rfc3339());
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.project_key.is_empty() {
            return Err(ModelError::MissingProjectKey);
        }
        for (idx, entry) in self.issues.iter().enumerate() {
            if entry.id.is_empty() {
                return Err(ModelError::EmptyIndexEntry(idx));
            }
        }
        Ok(())
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|existing| existing == value) {
        values.push(value.to_string());
    }
}

fn project_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9-]+$").expect("regex"))
}

fn record_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("regex"))
}

fn issue_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)-(\d+)$").expect("regex"))
}

pub fn is_valid_project_key(key: &str) -> bool {
    project_key_re().is_match(key)
}

pub fn validate_project_key(key: &str) -> Result<(), ModelError> {
    if key.is_empty() {
        return Err(ModelError::MissingProjectKey);
    }
    if !is_valid_project_key(key) {
        return Err(ModelError::InvalidProjectKey(key.to_string()));
    }
    Ok(())
}

pub fn validate_record_id(id: &str) -> Result<(), ModelError> {
    if !record_id_re().is_match(id) {
        return Err(ModelError::InvalidRecordId(id.to_string()));
    }
    Ok(())
}

pub fn generate_issue_id(project_key: &str, sequence: u64) -> String {
    format!("{project_key}-{sequence}")
}

/// Splits `KEY-N` on the last hyphen, so keys may contain hyphens.
pub fn parse_issue_id(id: &str) -> Result<(String, u64), ModelError> {
    let caps = issue_id_re()
        .captures(id)
        .ok_or_else(|| ModelError::InvalidIssueId(id.to_string()))?;
    let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let sequence = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .ok_or_else(|| ModelError::InvalidIssueId(id.to_string()))?;
    Ok((key.to_string(), sequence))
}

/// Trailing number of an epic id such as `E-7`.
pub fn epic_sequence(id: &str) -> Option<u64> {
    let (_, tail) = id.rsplit_once('-')?;
    tail.parse().ok()
}
