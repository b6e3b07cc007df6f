//! Black-box runs of the checker binary for paths that need no Flatpak.

use std::process::{Command, Output};

fn checker(args: &[&str], data_home: &std::path::Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_flathub-repro-checker"))
        .args(args)
        .env("XDG_DATA_HOME", data_home)
        .env_remove("FLATPAK_USER_DIR")
        .env_remove("REPRO_CHECKER_TIMEOUT")
        .env_remove("GITHUB_RUN_ID")
        .env_remove("CI_PIPELINE_URL")
        .output()
        .unwrap()
}

#[test]
fn version_flag_prints_version() {
    let dir = tempfile::tempdir().unwrap();
    let out = checker(&["--version"], dir.path());
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn json_mode_without_appid_emits_one_failure_record() {
    let dir = tempfile::tempdir().unwrap();
    let out = checker(&["--json"], dir.path());

    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8(out.stdout).unwrap();
    let record: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(record["status_code"], "1");
    assert_eq!(record["appid"], "");
    for key in ["timestamp", "log_url", "result_url", "message"] {
        assert!(record[key].is_string());
    }
}

#[test]
fn human_mode_failure_exits_one_with_empty_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let out = checker(&[], dir.path());
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
}

#[test]
fn json_cleanup_emits_exactly_one_record() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("flathub_repro_checker/flatpak_root")).unwrap();

    let out = checker(&["--cleanup", "--json"], dir.path());
    assert_eq!(out.status.code(), Some(0));

    let stdout = String::from_utf8(out.stdout).unwrap();
    let mut stream = serde_json::Deserializer::from_str(&stdout).into_iter::<serde_json::Value>();
    let record = stream.next().unwrap().unwrap();
    assert!(stream.next().is_none());
    assert_eq!(record["appid"], "");

    // Root refuses before cleanup runs; anyone else gets the cleanup outcome.
    if record["message"] != "Running the checker as root is unsupported" {
        assert_eq!(record["status_code"], "0");
        assert!(record["message"]
            .as_str()
            .unwrap()
            .starts_with("Cleaning up: "));
        assert!(!dir.path().join("flathub_repro_checker").exists());
    }
}
