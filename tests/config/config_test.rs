//! Tests for loading caller configuration from disk.

use std::time::Duration;

use forcequit::config::{load_config, load_config_or_default, RuntimePaths};

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config =
        load_config_or_default(&tmp.path().join("config.toml")).expect("defaults for missing file");
    assert_eq!(config.termination.settings().grace_period, Duration::from_secs(2));
    assert_eq!(config.validation.interval_secs, 30);
    assert!(config.helper.source_binary.is_none());
}

#[test]
fn file_values_override_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[ipc]
socket_path = "/tmp/fq.sock"
request_timeout_secs = 3

[validation]
rule_timeout_ms = 750

[policy]
preserved_names = ["emacs"]
"#,
    )
    .expect("write config");

    let config = load_config(&path).expect("valid config");
    assert_eq!(config.ipc.socket_path.to_str(), Some("/tmp/fq.sock"));
    assert_eq!(config.ipc.request_timeout_secs, 3);
    assert_eq!(config.validation.rule_timeout_ms, 750);
    assert_eq!(config.validation.interval_secs, 30);
    assert_eq!(config.policy.preserved_names, vec!["emacs"]);
}

#[test]
fn malformed_file_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[termination\ngrace_period_ms = ").expect("write config");
    let err = load_config_or_default(&path).expect_err("parse failure");
    assert!(err.to_string().contains("failed to parse"));
}

#[test]
fn zero_poll_interval_is_clamped() {
    let config: forcequit::config::Config =
        toml::from_str("[termination]\npoll_interval_ms = 0").expect("should parse");
    assert_eq!(config.termination.settings().poll_interval, Duration::from_millis(1));
}

#[test]
fn runtime_paths_layout() {
    let paths = RuntimePaths::under("/home/u/.forcequit");
    assert_eq!(paths.config_file.to_str(), Some("/home/u/.forcequit/config.toml"));
    assert_eq!(paths.state_file.to_str(), Some("/home/u/.forcequit/state.json"));
    assert!(paths.audit_file.ends_with("audit/audit.jsonl"));
}
