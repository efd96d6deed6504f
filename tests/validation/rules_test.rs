//! Tests for the built-in rules in `src/validation/rules.rs`.

use std::sync::Arc;

use forcequit::auth::{HelperServiceStatus, StaticInstaller};
use forcequit::policy::{PolicyTables, SafetyClassifier};
use forcequit::validation::rules::{
    yama_outcome, HelperIntegrityRule, PolicyTableIntegrityRule, RuntimeDirPermissionsRule,
    SelfBinaryIntegrityRule, HELPER_INTEGRITY,
};
use forcequit::validation::{RulePriority, SecurityRule};

#[tokio::test]
async fn binary_rule_detects_modification() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let exe = tmp.path().join("forcequit");
    std::fs::write(&exe, b"original build").expect("write binary");

    let rule = SelfBinaryIntegrityRule::capture(exe.clone());
    assert_eq!(rule.priority(), RulePriority::Critical);
    assert!(rule.evaluate().await.passed);

    std::fs::write(&exe, b"patched build").expect("overwrite binary");
    let outcome = rule.evaluate().await;
    assert!(!outcome.passed);
    assert!(outcome.detail.contains("changed"));
}

#[tokio::test]
async fn binary_rule_fails_without_startup_digest() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let rule = SelfBinaryIntegrityRule::capture(tmp.path().join("missing"));
    assert!(!rule.evaluate().await.passed);
}

#[tokio::test]
async fn policy_rule_passes_for_unchanged_tables() {
    let classifier = Arc::new(SafetyClassifier::new(PolicyTables::linux(), 1));
    let rule = PolicyTableIntegrityRule::capture(classifier);
    assert!(rule.evaluate().await.passed);
}

#[tokio::test]
async fn helper_rule_fails_only_when_compromised() {
    let installer = Arc::new(StaticInstaller::new(HelperServiceStatus::Installed));
    let rule = HelperIntegrityRule::new(installer.clone());
    assert_eq!(rule.id(), HELPER_INTEGRITY);
    assert!(rule.evaluate().await.passed);

    installer.set_status(HelperServiceStatus::NotInstalled);
    assert!(rule.evaluate().await.passed);

    installer.set_status(HelperServiceStatus::Compromised);
    assert!(!rule.evaluate().await.passed);
}

#[test]
fn yama_scope_zero_fails() {
    assert!(!yama_outcome("0\n").passed);
    assert!(yama_outcome("1\n").passed);
    assert!(yama_outcome("3").passed);
    assert!(!yama_outcome("garbage").passed);
}

#[cfg(unix)]
#[tokio::test]
async fn world_writable_state_dir_fails() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let dir = tmp.path().join("state");
    std::fs::create_dir(&dir).expect("create dir");
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).expect("chmod");

    let rule = RuntimeDirPermissionsRule::new(dir.clone());
    assert!(rule.evaluate().await.passed);

    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).expect("chmod");
    assert!(!rule.evaluate().await.passed);
}

#[tokio::test]
async fn missing_state_dir_passes() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let rule = RuntimeDirPermissionsRule::new(tmp.path().join("not-yet"));
    assert!(rule.evaluate().await.passed);
}
