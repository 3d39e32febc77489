use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn bin(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_buyruk"));
    cmd.arg("--home")
        .arg(home)
        .env_remove("BUYRUK_HOME")
        .env_remove("BUYRUK_LOG")
        .stdin(Stdio::null());
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    bin(home).args(args).output().expect("run")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn version_prints_package_version() {
    let temp = TempDir::new().expect("tempdir");
    let output = run(temp.path(), &["version"]);
    assert!(output.status.success());
    assert!(stdout(&output).starts_with(&format!("buyruk {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn create_list_and_duplicate() {
    let temp = TempDir::new().expect("tempdir");
    let output = run(temp.path(), &["project", "create", "CORE", "--name", "Core Platform"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Created project CORE"));

    let project_dir = temp.path().join("projects").join("CORE");
    assert!(project_dir.join("project.json").is_file());
    assert!(project_dir.join("issues").is_dir());
    assert!(project_dir.join("epics").is_dir());

    let output = run(temp.path(), &["project", "create", "CORE"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("already exists"));

    let output = run(temp.path(), &["project", "list"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("CORE - Core Platform (0 issues, 0 epics)"));

    let output = run(temp.path(), &["--format", "json", "project", "list"]);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value[0]["key"], "CORE");
}

#[test]
fn invalid_project_key_is_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let output = run(temp.path(), &["project", "create", "../escape"]);
    assert!(!output.status.success());
    assert!(!temp.path().join("escape").exists());
    assert!(!temp.path().join("projects").join("escape").exists());
}

#[test]
fn delete_requires_confirmation() {
    let temp = TempDir::new().expect("tempdir");
    assert!(run(temp.path(), &["project", "create", "CORE"]).status.success());

    // stdin is closed, so the prompt reads no answer.
    let output = run(temp.path(), &["project", "delete", "CORE"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("deletion cancelled"));
    assert!(temp.path().join("projects").join("CORE").is_dir());

    let output = run(temp.path(), &["project", "delete", "CORE", "--yes"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(!temp.path().join("projects").join("CORE").exists());
}

#[test]
fn pending_marker_is_reported_and_repaired() {
    let temp = TempDir::new().expect("tempdir");
    assert!(run(temp.path(), &["project", "create", "CORE"]).status.success());
    let marker = temp.path().join("projects").join("CORE").join(".pending");
    std::fs::write(
        &marker,
        r#"{"operation":"write_json","timestamp":"2026-01-01T00:00:00Z","metadata":{}}"#,
    )
    .expect("marker");

    let output = run(temp.path(), &["--project", "CORE", "list"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("pending transaction"));

    let output = run(temp.path(), &["project", "delete", "CORE"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("pending transaction"));

    let output = run(temp.path(), &["project", "repair", "CORE"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(!marker.exists());
}

#[test]
fn delete_succeeds_with_corrupt_index() {
    let temp = TempDir::new().expect("tempdir");
    let output = run(temp.path(), &["project", "create", "CORE"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let project_dir = temp.path().join("projects").join("CORE");
    std::fs::write(project_dir.join("project.json"), "{oops").expect("corrupt");

    let output = run(temp.path(), &["project", "list"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("CORE (0 issues, 0 epics) [index needs repair]"));

    let output = run(temp.path(), &["project", "delete", "CORE", "--yes"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Deleted project CORE"));
    assert!(!project_dir.exists());
}
