use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use predicates::prelude::*;

/// Copy tool standing in for rsync: copies the tree, then deletes every source file that does
/// not end in `.keep`, printing rsync-like progress as it goes.
const FAKE_RSYNC: &str = r#"#!/bin/sh
src="$3"
dst="$4"
echo "sending incremental file list"
cp -R "$src" "$dst"/ || exit 23
find "$src" -type f | sort | while read -r file; do
    echo "$file"
    echo "              3 100%    0.00kB/s    0:00:00 (xfr#1, to-chk=0/1)"
    case "$file" in
        *.keep) ;;
        *) rm "$file" ;;
    esac
done
echo "total size is 3  speedup is 1.00"
"#;

fn write_copy_tool(dir: &Path) -> PathBuf {
    let tool = dir.join("fake-rsync");
    std::fs::write(&tool, FAKE_RSYNC).unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    tool
}

/// src/show/{e01.mkv, e02.mkv, extras/trailer.mkv} and an empty dst/
fn setup_test_env() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let show = tmp.path().join("src").join("show");
    std::fs::create_dir_all(show.join("extras")).unwrap();
    std::fs::write(show.join("e01.mkv"), "e01").unwrap();
    std::fs::write(show.join("e02.mkv"), "e02").unwrap();
    std::fs::write(show.join("extras").join("trailer.mkv"), "trailer").unwrap();
    let dst = tmp.path().join("dst");
    std::fs::create_dir(&dst).unwrap();
    (tmp, show, dst)
}

fn rmv(tool: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.arg("--copy-tool").arg(tool);
    cmd
}

fn check_moved(dst: &Path) {
    let show = dst.join("show");
    assert_eq!(std::fs::read_to_string(show.join("e01.mkv")).unwrap(), "e01");
    assert_eq!(std::fs::read_to_string(show.join("e02.mkv")).unwrap(), "e02");
    assert_eq!(
        std::fs::read_to_string(show.join("extras").join("trailer.mkv")).unwrap(),
        "trailer"
    );
}

#[test]
fn check_rmv_help() {
    let mut cmd = assert_cmd::Command::cargo_bin("rmv").unwrap();
    cmd.arg("--help").assert();
}

#[test]
fn test_move_removes_source() {
    let (tmp, show, dst) = setup_test_env();
    let tool = write_copy_tool(tmp.path());
    rmv(&tool)
        .arg("--summary")
        .arg(&show)
        .arg(&dst)
        .assert()
        .success()
        .stdout(predicate::str::contains("status: moved"))
        .stdout(predicate::str::contains("files moved: 3"));
    check_moved(&dst);
    assert!(!show.exists());
}

#[test]
fn test_dry_run_keeps_empty_source_tree() {
    let (tmp, show, dst) = setup_test_env();
    let tool = write_copy_tool(tmp.path());
    rmv(&tool)
        .arg("--dry-run")
        .arg(&show)
        .arg(&dst)
        .assert()
        .success();
    check_moved(&dst);
    assert!(show.join("extras").is_dir());
    assert!(!show.join("e01.mkv").exists());
}

#[test]
fn test_leftover_file_keeps_source() {
    let (tmp, show, dst) = setup_test_env();
    std::fs::write(show.join("e03.mkv.keep"), "partial").unwrap();
    let tool = write_copy_tool(tmp.path());
    rmv(&tool)
        .arg(&show)
        .arg(&dst)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("still present"));
    assert_eq!(
        std::fs::read_to_string(show.join("e03.mkv.keep")).unwrap(),
        "partial"
    );
    assert!(show.join("extras").is_dir());
}

#[test]
fn test_json_report() {
    let (tmp, show, dst) = setup_test_env();
    let tool = write_copy_tool(tmp.path());
    let output = rmv(&tool)
        .arg("--json")
        .arg(&show)
        .arg(&dst)
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(output.stdout.trim_ascii()).unwrap();
    assert_eq!(report["status"], "moved");
    assert_eq!(report["record"]["files"].as_array().unwrap().len(), 3);
    assert_eq!(report["record"]["bytes"], 9);
    assert_eq!(report["error"], serde_json::Value::Null);
}

#[test]
fn test_json_report_on_leftovers() {
    let (tmp, show, dst) = setup_test_env();
    std::fs::write(show.join("e03.mkv.keep"), "partial").unwrap();
    let tool = write_copy_tool(tmp.path());
    let output = rmv(&tool)
        .args(["--json", "--quiet"])
        .arg(&show)
        .arg(&dst)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value =
        serde_json::from_slice(output.stdout.trim_ascii()).unwrap();
    assert_eq!(report["status"], "files-remaining");
    let remaining = report["remaining"].as_array().unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].as_str().unwrap().ends_with("e03.mkv.keep"));
}

#[test]
fn test_missing_copy_tool_fails_without_touching_source() {
    let (tmp, show, dst) = setup_test_env();
    rmv(&tmp.path().join("no-such-tool"))
        .arg(&show)
        .arg(&dst)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("failed to spawn"));
    assert_eq!(std::fs::read_to_string(show.join("e01.mkv")).unwrap(), "e01");
}

#[test]
fn test_supervised_mode_stops_on_sigterm() {
    let (tmp, show, dst) = setup_test_env();
    let tool = write_copy_tool(tmp.path());
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("rmv"))
        .arg("--copy-tool")
        .arg(&tool)
        .args(["--every", "1h", "--poll-interval", "100ms", "--summary"])
        .arg(&show)
        .arg(&dst)
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while show.exists() {
        assert!(std::time::Instant::now() < deadline, "first cycle never finished");
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    check_moved(&dst);
    let status = std::process::Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("cycles: 1"), "{stdout}");
}

#[test]
fn test_supervised_mode_idles_once_source_is_gone() {
    let (tmp, show, dst) = setup_test_env();
    let tool = write_copy_tool(tmp.path());
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("rmv"))
        .arg("--copy-tool")
        .arg(&tool)
        .args([
            "--every",
            "300ms",
            "--failure-sleep",
            "50ms",
            "--poll-interval",
            "50ms",
            "--summary",
        ])
        .arg(&show)
        .arg(&dst)
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while show.exists() {
        assert!(std::time::Instant::now() < deadline, "first cycle never finished");
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    // several periods with the source already moved away
    std::thread::sleep(std::time::Duration::from_millis(1500));
    let status = std::process::Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("failed cycles: 0"), "{stdout}");
    let cycles: u64 = stdout
        .lines()
        .find_map(|line| line.strip_prefix("cycles: "))
        .unwrap()
        .parse()
        .unwrap();
    assert!(cycles >= 3, "{stdout}");
    check_moved(&dst);
}

#[test]
fn test_real_rsync_move() {
    let Ok(version) = std::process::Command::new("rsync").arg("--version").output() else {
        eprintln!("rsync not installed, skipping");
        return;
    };
    assert!(version.status.success());
    let (_tmp, show, dst) = setup_test_env();
    assert_cmd::Command::cargo_bin("rmv")
        .unwrap()
        .args(["--summary", "-v"])
        .arg(&show)
        .arg(&dst)
        .assert()
        .success()
        .stdout(predicate::str::contains("files moved: 3"))
        .stdout(predicate::str::contains("files announced"));
    check_moved(&dst);
    assert!(!show.exists());
}
