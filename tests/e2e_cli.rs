//! CLI end-to-end tests
//!
//! Tests for the ffpilot command-line interface. Commands that spawn ffmpeg
//! run against shell scripts configured through a temporary config file.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{tempdir, TempDir};

/// Get a command for the ffpilot binary, run from an empty directory so no
/// stray config file is picked up.
#[allow(deprecated)]
fn ffpilot_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ffpilot").unwrap();
    cmd.current_dir(dir);
    cmd
}

/// Write a config file pointing ffmpeg at a script running `body`.
#[cfg(unix)]
fn fake_ffmpeg(dir: &TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.path().join("ffmpeg");
    fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        format!("[tools]\nffmpeg_path = \"{}\"\n", script.display()),
    )
    .unwrap();
    config
}

#[test]
fn test_cli_no_args_shows_help() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_help_flag() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ffpilot"))
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_version_command() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("ffpilot "));
}

#[test]
fn test_cli_run_help() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Transcode inputs"));
}

#[test]
fn test_cli_run_dry_run_prints_arguments() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .args([
            "run", "-i", "in.mp4", "-o", "out.mp4", "--video-codec", "libx264", "--size",
            "640x?", "-y", "--option=-crf", "--option=23", "--dry-run",
        ])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("ffmpeg -i in.mp4 -y -vcodec libx264"))
        .stdout(predicate::str::contains("scale=w=640:h=trunc(ow/a/2)*2"))
        .stdout(predicate::str::contains("-crf 23 out.mp4"));
}

#[test]
fn test_cli_run_rejects_bad_size() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .args(["run", "-i", "in.mp4", "-o", "out.mp4", "--size", "huge", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid size"));
}

#[cfg(unix)]
#[test]
fn test_cli_run_invokes_ffmpeg() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("args.log");
    let config = fake_ffmpeg(&dir, &format!("echo \"$@\" > '{}'", log.display()));

    ffpilot_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "-i", "in.mp4", "-o", "out.mkv", "--audio-codec", "copy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote out.mkv"));

    let args = fs::read_to_string(&log).unwrap();
    assert_eq!(args.trim(), "-i in.mp4 -acodec copy out.mkv");
}

#[cfg(unix)]
#[test]
fn test_cli_run_reports_ffmpeg_failure() {
    let dir = tempdir().unwrap();
    let config = fake_ffmpeg(&dir, "echo 'in.mp4: Invalid data found when processing input' >&2; exit 1");

    ffpilot_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "-i", "in.mp4", "-o", "out.mp4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Transcoding to out.mp4 failed"))
        .stderr(predicate::str::contains("Invalid data found"));
}

#[test]
fn test_cli_probe_missing_file() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .args(["probe", "does-not-exist.mkv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_cli_check_tools_command() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .arg("check-tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("ffmpeg"))
        .stdout(predicate::str::contains("ffprobe"));
}

#[test]
fn test_cli_capabilities_unknown_kind() {
    let dir = tempdir().unwrap();
    ffpilot_cmd(dir.path())
        .args(["capabilities", "muxers"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("muxers"));
}

#[cfg(unix)]
#[test]
fn test_cli_capabilities_json() {
    let dir = tempdir().unwrap();
    let config = fake_ffmpeg(
        &dir,
        "cat <<'EOF'
File formats:
 D. = Demuxing supported
 .E = Muxing supported
 --
 DE matroska,webm   Matroska / WebM
  E mp4             MP4 (MPEG-4 Part 14)
EOF",
    );

    let output = ffpilot_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["capabilities", "formats", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["webm"]["can_demux"], true);
    assert_eq!(json["mp4"]["can_mux"], true);
    assert_eq!(json["mp4"]["can_demux"], false);
}

#[test]
fn test_cli_validate_config() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("ffpilot.toml");
    fs::write(&config, "[run]\nniceness = 5\ntimeout_secs = 30\n").unwrap();

    ffpilot_cmd(dir.path())
        .arg("validate")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Niceness: 5"))
        .stdout(predicate::str::contains("Timeout: 30s"));
}

#[test]
fn test_cli_validate_picks_up_local_config() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("ffpilot.toml"), "[run]\nniceness = 99\n").unwrap();

    ffpilot_cmd(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("warning"))
        .stdout(predicate::str::contains("clamped"));
}

#[test]
fn test_cli_validate_rejects_malformed_config() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("broken.toml");
    fs::write(&config, "[run\nniceness = ").unwrap();

    ffpilot_cmd(dir.path())
        .arg("validate")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}
