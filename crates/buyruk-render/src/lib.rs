//! Output renderers for issues, epics and project indexes.

use std::io::Write;

use buyruk_core::models::{Epic, IndexEntry, Issue, ProjectIndex};
use serde::Serialize;
use thiserror::Error;

pub use buyruk_core::config::OutputFormat as Format;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to encode csv: {0}")]
    Csv(#[from] csv::Error),
}

pub trait Renderer {
    fn render_issue(&self, issue: &Issue, out: &mut dyn Write) -> Result<(), RenderError>;
    fn render_issues(&self, issues: &[Issue], out: &mut dyn Write) -> Result<(), RenderError>;
    /// `issues` are the index entries linked to the epic.
    fn render_epic(
        &self,
        epic: &Epic,
        issues: &[IndexEntry],
        out: &mut dyn Write,
    ) -> Result<(), RenderError>;
    fn render_epics(&self, epics: &[Epic], out: &mut dyn Write) -> Result<(), RenderError>;
    fn render_project(&self, index: &ProjectIndex, out: &mut dyn Write)
        -> Result<(), RenderError>;
}

pub fn renderer_for(format: Format) -> Box<dyn Renderer> {
    match format {
        Format::Modern => Box::new(ModernRenderer),
        Format::Json => Box::new(JsonRenderer),
        Format::Csv => Box::new(CsvRenderer),
    }
}

/// Human-readable detail views and space-aligned tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModernRenderer;

fn write_table(
    out: &mut dyn Write,
    header: &[&str],
    rows: &[Vec<String>],
) -> Result<(), RenderError> {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
    }
    let line = |cells: Vec<&str>| {
        let last = cells.len().saturating_sub(1);
        cells
            .iter()
            .enumerate()
            .map(|(idx, cell)| {
                if idx == last {
                    cell.to_string()
                } else {
                    format!("{cell:<width$}", width = widths[idx])
                }
            })
            .collect::<Vec<_>>()
            .join("  ")
    };
    writeln!(out, "{}", line(header.to_vec()))?;
    for row in rows {
        writeln!(out, "{}", line(row.iter().map(String::as_str).collect()))?;
    }
    Ok(())
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

impl Renderer for ModernRenderer {
    fn render_issue(&self, issue: &Issue, out: &mut dyn Write) -> Result<(), RenderError> {
        writeln!(out, "{} {}", issue.id, issue.title)?;
        writeln!(out)?;
        writeln!(out, "Status: {}", issue.status)?;
        if let Some(priority) = issue.priority {
            writeln!(out, "Priority: {priority}")?;
        }
        writeln!(out, "Type: {}", issue.issue_type)?;
        if let Some(epic_id) = issue.epic_id.as_deref() {
            writeln!(out, "Epic: {epic_id}")?;
        }
        if let Some(description) = issue.description.as_deref() {
            writeln!(out)?;
            writeln!(out, "Description")?;
            writeln!(out, "{description}")?;
        }
        if !issue.blocked_by.is_empty() {
            writeln!(out)?;
            writeln!(out, "Blocked By: {}", issue.blocked_by.join(", "))?;
        }
        if !issue.prs.is_empty() {
            writeln!(out, "Pull Requests:")?;
            for pr in &issue.prs {
                writeln!(out, "  - {pr}")?;
            }
        }
        Ok(())
    }

    fn render_issues(&self, issues: &[Issue], out: &mut dyn Write) -> Result<(), RenderError> {
        if issues.is_empty() {
            writeln!(out, "No issues found.")?;
            return Ok(());
        }
        let rows: Vec<Vec<String>> = issues
            .iter()
            .map(|issue| {
                vec![
                    issue.id.clone(),
                    issue.title.clone(),
                    issue.status.to_string(),
                    or_dash(issue.priority.map(|p| p.as_str())),
                    issue.issue_type.to_string(),
                ]
            })
            .collect();
        write_table(out, &["ID", "TITLE", "STATUS", "PRIORITY", "TYPE"], &rows)
    }

    fn render_epic(
        &self,
        epic: &Epic,
        issues: &[IndexEntry],
        out: &mut dyn Write,
    ) -> Result<(), RenderError> {
        writeln!(out, "{} {}", epic.id, epic.title)?;
        writeln!(out)?;
        writeln!(out, "Status: {}", epic.status)?;
        if let Some(description) = epic.description.as_deref() {
            writeln!(out)?;
            writeln!(out, "Description")?;
            writeln!(out, "{description}")?;
        }
        if !issues.is_empty() {
            writeln!(out)?;
            writeln!(out, "Issues ({})", issues.len())?;
            let rows: Vec<Vec<String>> = issues.iter().map(entry_row).collect();
            write_table(out, &["ID", "TITLE", "STATUS", "TYPE"], &rows)?;
        }
        Ok(())
    }

    fn render_epics(&self, epics: &[Epic], out: &mut dyn Write) -> Result<(), RenderError> {
        if epics.is_empty() {
            writeln!(out, "No epics found.")?;
            return Ok(());
        }
        let rows: Vec<Vec<String>> = epics
            .iter()
            .map(|epic| vec![epic.id.clone(), epic.title.clone(), epic.status.to_string()])
            .collect();
        write_table(out, &["ID", "TITLE", "STATUS"], &rows)
    }

    fn render_project(&self, index: &ProjectIndex, out: &mut dyn Write) -> Result<(), RenderError> {
        match index.project_name.as_deref() {
            Some(name) => writeln!(out, "{} - {name}", index.project_key)?,
            None => writeln!(out, "{}", index.project_key)?,
        }
        writeln!(out)?;
        if index.issues.is_empty() {
            writeln!(out, "No issues found.")?;
            return Ok(());
        }
        let rows: Vec<Vec<String>> = index.issues.iter().map(entry_row).collect();
        write_table(out, &["ID", "TITLE", "STATUS", "TYPE"], &rows)
    }
}

fn entry_row(entry: &IndexEntry) -> Vec<String> {
    vec![
        entry.id.clone(),
        entry.title.clone(),
        entry.status.to_string(),
        entry.issue_type.to_string(),
    ]
}

/// Pretty-printed JSON of the stored records.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

fn write_json<T: Serialize + ?Sized>(value: &T, out: &mut dyn Write) -> Result<(), RenderError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

#[derive(Serialize)]
struct EpicWithIssues<'a> {
    #[serde(flatten)]
    epic: &'a Epic,
    issues: &'a [IndexEntry],
}

impl Renderer for JsonRenderer {
    fn render_issue(&self, issue: &Issue, out: &mut dyn Write) -> Result<(), RenderError> {
        write_json(issue, out)
    }

    fn render_issues(&self, issues: &[Issue], out: &mut dyn Write) -> Result<(), RenderError> {
        write_json(issues, out)
    }

    fn render_epic(
        &self,
        epic: &Epic,
        issues: &[IndexEntry],
        out: &mut dyn Write,
    ) -> Result<(), RenderError> {
        write_json(&EpicWithIssues { epic, issues }, out)
    }

    fn render_epics(&self, epics: &[Epic], out: &mut dyn Write) -> Result<(), RenderError> {
        write_json(epics, out)
    }

    fn render_project(&self, index: &ProjectIndex, out: &mut dyn Write) -> Result<(), RenderError> {
        write_json(index, out)
    }
}

/// One header row followed by one row per record. List fields are joined
/// with `;`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRenderer;

#[derive(Serialize)]
struct IssueRow<'a> {
    id: &'a str,
    title: &'a str,
    status: &'static str,
    priority: &'static str,
    #[serde(rename = "type")]
    issue_type: &'static str,
    epic_id: &'a str,
    blocked_by: String,
    prs: String,
    created_at: &'a str,
    updated_at: &'a str,
}

impl<'a> From<&'a Issue> for IssueRow<'a> {
    fn from(issue: &'a Issue) -> Self {
        Self {
            id: &issue.id,
            title: &issue.title,
            status: issue.status.as_str(),
            priority: issue.priority.map(|p| p.as_str()).unwrap_or(""),
            issue_type: issue.issue_type.as_str(),
            epic_id: issue.epic_id.as_deref().unwrap_or(""),
            blocked_by: issue.blocked_by.join(";"),
            prs: issue.prs.join(";"),
            created_at: issue.created_at.as_deref().unwrap_or(""),
            updated_at: issue.updated_at.as_deref().unwrap_or(""),
        }
    }
}

#[derive(Serialize)]
struct EpicRow<'a> {
    id: &'a str,
    title: &'a str,
    status: &'static str,
    description: &'a str,
    created_at: &'a str,
    updated_at: &'a str,
}

impl<'a> From<&'a Epic> for EpicRow<'a> {
    fn from(epic: &'a Epic) -> Self {
        Self {
            id: &epic.id,
            title: &epic.title,
            status: epic.status.as_str(),
            description: epic.description.as_deref().unwrap_or(""),
            created_at: epic.created_at.as_deref().unwrap_or(""),
            updated_at: epic.updated_at.as_deref().unwrap_or(""),
        }
    }
}

#[derive(Serialize)]
struct EntryRow<'a> {
    id: &'a str,
    title: &'a str,
    status: &'static str,
    #[serde(rename = "type")]
    issue_type: &'static str,
    epic_id: &'a str,
}

impl<'a> From<&'a IndexEntry> for EntryRow<'a> {
    fn from(entry: &'a IndexEntry) -> Self {
        Self {
            id: &entry.id,
            title: &entry.title,
            status: entry.status.as_str(),
            issue_type: entry.issue_type.as_str(),
            epic_id: entry.epic_id.as_deref().unwrap_or(""),
        }
    }
}

fn write_rows<R: Serialize>(
    rows: impl IntoIterator<Item = R>,
    header: &[&str],
    out: &mut dyn Write,
) -> Result<(), RenderError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(out);
    writer.write_record(header)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

const ISSUE_HEADER: [&str; 10] = [
    "id",
    "title",
    "status",
    "priority",
    "type",
    "epic_id",
    "blocked_by",
    "prs",
    "created_at",
    "updated_at",
];
const EPIC_HEADER: [&str; 6] = ["id", "title", "status", "description", "created_at", "updated_at"];
const ENTRY_HEADER: [&str; 5] = ["id", "title", "status", "type", "epic_id"];

impl Renderer for CsvRenderer {
    fn render_issue(&self, issue: &Issue, out: &mut dyn Write) -> Result<(), RenderError> {
        write_rows([IssueRow::from(issue)], &ISSUE_HEADER, out)
    }

    fn render_issues(&self, issues: &[Issue], out: &mut dyn Write) -> Result<(), RenderError> {
        write_rows(issues.iter().map(IssueRow::from), &ISSUE_HEADER, out)
    }

    fn render_epic(
        &self,
        epic: &Epic,
        _issues: &[IndexEntry],
        out: &mut dyn Write,
    ) -> Result<(), RenderError> {
        write_rows([EpicRow::from(epic)], &EPIC_HEADER, out)
    }

    fn render_epics(&self, epics: &[Epic], out: &mut dyn Write) -> Result<(), RenderError> {
        write_rows(epics.iter().map(EpicRow::from), &EPIC_HEADER, out)
    }

    fn render_project(&self, index: &ProjectIndex, out: &mut dyn Write) -> Result<(), RenderError> {
        write_rows(index.issues.iter().map(EntryRow::from), &ENTRY_HEADER, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buyruk_core::models::{Priority, Status};
    use pretty_assertions::assert_eq;

    fn sample() -> Issue {
        Issue {
            id: "CORE-1".to_string(),
            title: "Fix login, again".to_string(),
            status: Status::Doing,
            priority: Some(Priority::High),
            blocked_by: vec!["CORE-2".to_string(), "CORE-3".to_string()],
            ..Issue::default()
        }
    }

    fn render(f: impl FnOnce(&mut dyn Write) -> Result<(), RenderError>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).expect("render");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn modern_issue_detail() {
        let text = render(|out| ModernRenderer.render_issue(&sample(), out));
        assert!(text.starts_with("CORE-1 Fix login, again\n"));
        assert!(text.contains("Status: DOING"));
        assert!(text.contains("Priority: HIGH"));
        assert!(text.contains("Blocked By: CORE-2, CORE-3"));
    }

    #[test]
    fn modern_table_aligns_columns() {
        let mut other = sample();
        other.id = "CORE-10".to_string();
        other.title = "Short".to_string();
        other.priority = None;
        let text = render(|out| ModernRenderer.render_issues(&[sample(), other], out));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID       TITLE"));
        let status_col = lines[0].find("STATUS").expect("status header");
        assert_eq!(&lines[1][status_col..status_col + 5], "DOING");
        assert_eq!(&lines[2][status_col..status_col + 5], "DOING");
        assert!(lines[2].contains(" - "));
    }

    #[test]
    fn modern_empty_lists() {
        assert_eq!(render(|out| ModernRenderer.render_issues(&[], out)), "No issues found.\n");
        assert_eq!(render(|out| ModernRenderer.render_epics(&[], out)), "No epics found.\n");
    }

    #[test]
    fn json_issue_uses_wire_names() {
        let text = render(|out| JsonRenderer.render_issue(&sample(), out));
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["id"], "CORE-1");
        assert_eq!(value["type"], "task");
        assert_eq!(value["blocked_by"][1], "CORE-3");
    }

    #[test]
    fn json_epic_includes_linked_issues() {
        let epic = Epic {
            id: "E-1".to_string(),
            title: "Launch".to_string(),
            ..Epic::default()
        };
        let entries = vec![IndexEntry::from(&sample())];
        let text = render(|out| JsonRenderer.render_epic(&epic, &entries, out));
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["id"], "E-1");
        assert_eq!(value["issues"][0]["id"], "CORE-1");
    }

    #[test]
    fn csv_quotes_and_joins() {
        let text = render(|out| CsvRenderer.render_issues(&[sample()], out));
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("id,title,status,priority,type,epic_id,blocked_by,prs,created_at,updated_at")
        );
        assert_eq!(
            lines.next(),
            Some("CORE-1,\"Fix login, again\",DOING,HIGH,task,,CORE-2;CORE-3,,,")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn csv_empty_list_still_has_header() {
        let text = render(|out| CsvRenderer.render_epics(&[], out));
        assert_eq!(text, "id,title,status,description,created_at,updated_at\n");
    }

    #[test]
    fn renderer_for_dispatches_on_format() {
        let text = render(|out| renderer_for(Format::Json).render_issues(&[], out));
        assert_eq!(text.trim(), "[]");
        let text = render(|out| renderer_for(Format::Csv).render_issues(&[], out));
        assert!(text.starts_with("id,title"));
    }
}
