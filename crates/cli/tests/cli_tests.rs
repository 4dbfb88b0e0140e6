#![allow(deprecated)] // cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("vellum.toml");
    fs::write(
        &path,
        format!(
            r#"
[storage]
type = "filesystem"
path = "{blobs}"

[metadata]
type = "sqlite"
path = "{db}"

[repository]
server_name = "cli-test"
"#,
            blobs = dir.join("blobs").display(),
            db = dir.join("meta.db").display(),
        ),
    )
    .unwrap();
    path
}

fn vellum(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vellum").unwrap();
    cmd.env_remove("VELLUM_CONFIG").arg("--config").arg(config);
    cmd
}

fn json(output: &[u8]) -> serde_json::Value {
    serde_json::from_slice(output).unwrap()
}

#[test]
fn put_add_version_and_get() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());
    let v1 = temp.path().join("v1.txt");
    let v2 = temp.path().join("v2.txt");
    fs::write(&v1, b"first").unwrap();
    fs::write(&v2, b"second").unwrap();

    vellum(&config).arg("init").assert().success();

    let put = vellum(&config)
        .args(["put", "--dir", "docs/../notes"])
        .arg(&v1)
        .output()
        .unwrap();
    assert!(put.status.success());
    let receipt = json(&put.stdout);
    let file_id = receipt["file_id"].as_str().unwrap().to_string();
    assert_eq!(receipt["version"], 1);
    assert_eq!(receipt["server"], "cli-test");
    assert_eq!(receipt["path"], format!("docs/notes/{file_id}/v1"));

    let added = vellum(&config)
        .args(["add-version", &file_id])
        .arg(&v2)
        .output()
        .unwrap();
    assert!(added.status.success());
    assert_eq!(json(&added.stdout)["version"], 2);

    vellum(&config)
        .args(["get", &file_id])
        .assert()
        .success()
        .stdout("second");

    let out = temp.path().join("out.txt");
    vellum(&config)
        .args(["get", &file_id, "--version", "1", "--output"])
        .arg(&out)
        .assert()
        .success()
        .stdout(contains(format!("{file_id}_v1")));
    assert_eq!(fs::read(&out).unwrap(), b"first");

    let versions = vellum(&config)
        .args(["versions", &file_id])
        .output()
        .unwrap();
    assert_eq!(json(&versions.stdout).as_array().unwrap().len(), 2);
}

#[test]
fn put_with_idempotency_key_replays() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());
    let file = temp.path().join("data.bin");
    fs::write(&file, b"payload").unwrap();

    let first = vellum(&config)
        .args(["put", "--idempotency-key", "job-42"])
        .arg(&file)
        .output()
        .unwrap();
    fs::write(&file, b"different payload").unwrap();
    let second = vellum(&config)
        .args(["put", "--idempotency-key", "job-42"])
        .arg(&file)
        .output()
        .unwrap();

    assert!(first.status.success());
    assert!(second.status.success());
    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn delete_then_stat_fails() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());
    let file = temp.path().join("data.bin");
    fs::write(&file, b"payload").unwrap();

    let put = vellum(&config).arg("put").arg(&file).output().unwrap();
    let file_id = json(&put.stdout)["file_id"].as_str().unwrap().to_string();

    let deleted = vellum(&config).args(["delete", &file_id]).output().unwrap();
    assert!(deleted.status.success());
    let report = json(&deleted.stdout);
    assert_eq!(report["versions_removed"], 1);
    assert!(report["warnings"].as_array().unwrap().is_empty());

    vellum(&config)
        .args(["stat", &file_id])
        .assert()
        .failure()
        .stderr(contains("file not found"));
}

#[test]
fn rejects_malformed_file_id() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());

    vellum(&config)
        .args(["stat", "../../etc/passwd"])
        .assert()
        .failure()
        .stderr(contains("invalid file id"));
}

#[test]
fn check_reports_ok() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());

    vellum(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(contains("\"ok\""));
}
