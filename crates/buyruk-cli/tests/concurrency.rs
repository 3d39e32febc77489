use std::collections::HashSet;
use std::path::Path;
use std::process::{Command, Stdio};

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

#[test]
fn parallel_processes_create_distinct_issues() {
    let temp = TempDir::new().expect("tempdir");
    let status = bin(temp.path())
        .args(["project", "create", "CORE"])
        .status()
        .expect("create project");
    assert!(status.success());

    let children: Vec<_> = (0..6)
        .map(|n| {
            bin(temp.path())
                .args(["--project", "CORE", "issue", "create", "--title"])
                .arg(format!("Parallel {n}"))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .expect("spawn")
        })
        .collect();

    let mut ids = HashSet::new();
    for child in children {
        let output = child.wait_with_output().expect("wait");
        assert!(
            output.status.success(),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let id = text
            .trim()
            .strip_prefix("Created issue ")
            .expect("created line")
            .to_string();
        ids.insert(id);
    }
    assert_eq!(ids.len(), 6);

    let project_dir = temp.path().join("projects").join("CORE");
    assert!(!project_dir.join(".lock").exists());
    assert!(!project_dir.join(".pending").exists());
    let index: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(project_dir.join("project.json")).expect("index"),
    )
    .expect("json");
    assert_eq!(index["issues"].as_array().map(Vec::len), Some(6));
}
