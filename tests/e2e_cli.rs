//! CLI end-to-end tests
//!
//! None of these need ffmpeg: they cover argument handling, profiles and
//! configuration.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

/// Get a command for the encodeforge binary
#[allow(deprecated)]
fn encodeforge_cmd() -> Command {
    let mut cmd = Command::cargo_bin("encodeforge").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_no_args_shows_help() {
    encodeforge_cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_version_command() {
    encodeforge_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("encodeforge "));
}

#[test]
fn test_cli_run_help() {
    encodeforge_cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--split"))
        .stdout(predicate::str::contains("--max-retries"));
}

#[test]
fn test_cli_run_rejects_bad_split() {
    encodeforge_cmd()
        .args(["run", "in.mkv", "-o", "out", "--split", "segments:0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid segment count"));
}

#[test]
fn test_cli_run_nonexistent_file() {
    let dir = tempdir().unwrap();
    encodeforge_cmd()
        .arg("run")
        .arg(dir.path().join("missing.mkv"))
        .arg("-o")
        .arg(dir.path().join("out"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_cli_probe_nonexistent_file() {
    encodeforge_cmd()
        .args(["probe", "/definitely/not/here.mkv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_cli_check_tools_command() {
    encodeforge_cmd()
        .arg("check-tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("ffmpeg"))
        .stdout(predicate::str::contains("ffprobe"));
}

#[test]
fn test_cli_profiles_list_includes_builtins() {
    encodeforge_cmd()
        .args(["profiles", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hls-h264-aac"))
        .stdout(predicate::str::contains("hls-hevc-hdr"))
        .stdout(predicate::str::contains("mp4-h264"))
        .stdout(predicate::str::contains("[system]"));
}

#[test]
fn test_cli_profiles_show() {
    let output = encodeforge_cmd()
        .args(["profiles", "show", "HLS-H264-AAC"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let profile: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(profile["name"], "hls-h264-aac");
    assert_eq!(profile["video"].as_array().unwrap().len(), 3);

    encodeforge_cmd()
        .args(["profiles", "show", "no-such-profile"])
        .assert()
        .failure();
}

#[test]
fn test_cli_profiles_export_then_validate() {
    let dir = tempdir().unwrap();
    encodeforge_cmd()
        .args(["profiles", "export"])
        .arg(dir.path())
        .assert()
        .success();

    let exported = dir.path().join("mp4-h264.json");
    assert!(exported.exists());
    encodeforge_cmd()
        .args(["profiles", "validate"])
        .arg(&exported)
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));

    // Without any video or audio output the profile must be rejected.
    let mut profile: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&exported).unwrap()).unwrap();
    profile["video"] = serde_json::json!([]);
    profile["audio"] = serde_json::json!([]);
    let broken = dir.path().join("broken.json");
    fs::write(&broken, serde_json::to_string(&profile).unwrap()).unwrap();
    encodeforge_cmd()
        .args(["profiles", "validate"])
        .arg(&broken)
        .assert()
        .failure()
        .stdout(predicate::str::contains("✗"));
}

#[test]
fn test_cli_config_validation() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        r#"
[dispatcher]
max_task_retries = 5

[workers]
node_id = "render-01"
video_workers = 2
audio_workers = 0
"#,
    )
    .unwrap();

    encodeforge_cmd()
        .arg("validate")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("render-01"))
        .stdout(predicate::str::contains("Max task retries: 5"))
        .stdout(predicate::str::contains("audio tasks will never run"));
}

#[test]
fn test_cli_invalid_config_fails() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, "[workers\nvideo_workers = ").unwrap();

    encodeforge_cmd()
        .args(["-c"])
        .arg(&config_path)
        .arg("validate")
        .assert()
        .failure();
}
