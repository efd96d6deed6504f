//! Tests for `src/policy/classifier.rs` against the Linux tables and a live
//! in-memory process table.

use std::path::PathBuf;

use forcequit::policy::{MatchedRule, PolicyTables, SafetyClassifier, SafetyTier};
use forcequit::process::memory::InMemoryHost;
use forcequit::process::ProcessDescriptor;

const USER: u32 = 1000;

fn desc(pid: u32, name: &str, exe: Option<&str>) -> ProcessDescriptor {
    ProcessDescriptor {
        pid,
        name: name.to_owned(),
        executable: exe.map(PathBuf::from),
        owner_uid: Some(USER),
        parent_pid: Some(900),
        signature_valid: true,
        launch_time: 1_700_000_000,
        foreground: true,
    }
}

fn classifier() -> SafetyClassifier {
    SafetyClassifier::new(PolicyTables::linux(), 4242)
}

#[test]
fn critical_linux_services_are_forbidden() {
    let c = classifier();
    for name in ["systemd", "systemd-logind", "dbus-daemon", "Xorg", "sshd"] {
        let d = desc(500, name, Some("/opt/whatever/bin/x"));
        let class = c.classify(&d, Some(USER));
        assert_eq!(class.tier, SafetyTier::Forbidden, "{name}");
        assert_eq!(class.rule, MatchedRule::CriticalName);
    }
}

#[test]
fn protected_root_is_forbidden_even_with_harmless_name() {
    let c = classifier();
    let d = desc(501, "notes", Some("/usr/lib/systemd/notes"));
    let class = c.classify(&d, Some(USER));
    assert_eq!(class.tier, SafetyTier::Forbidden);
    assert_eq!(class.rule, MatchedRule::ProtectedPath);
}

#[test]
fn kernel_threads_are_forbidden() {
    let c = classifier();
    let mut d = desc(77, "kworker/0:1", None);
    d.parent_pid = Some(2);
    d.owner_uid = Some(0);
    let class = c.classify(&d, Some(USER));
    assert_eq!(class.tier, SafetyTier::Forbidden);
    assert_eq!(class.rule, MatchedRule::KernelThread);
}

#[test]
fn user_application_under_home_is_safe() {
    let c = classifier();
    let d = desc(600, "firefox", Some("/home/ana/.local/firefox/firefox"));
    let class = c.classify(&d, Some(USER));
    assert_eq!(class.tier, SafetyTier::Safe);
    assert_eq!(class.rule, MatchedRule::UserApplication);
}

#[test]
fn system_binary_is_restricted() {
    let c = classifier();
    let d = desc(601, "cupsbrowse", Some("/usr/sbin/cupsbrowse"));
    assert_eq!(c.classify(&d, Some(USER)).tier, SafetyTier::Restricted);
}

#[test]
fn unsigned_code_is_dangerous() {
    let c = classifier();
    let mut d = desc(602, "miner", Some("/tmp/miner"));
    d.signature_valid = false;
    let class = c.classify(&d, Some(USER));
    assert_eq!(class.tier, SafetyTier::Dangerous);
    assert!(!class.reason.is_empty());
}

#[test]
fn unresolvable_pid_is_forbidden() {
    let host = InMemoryHost::new();
    let (found, class) = classifier().classify_pid(&host, 31337, Some(USER));
    assert!(found.is_none());
    assert_eq!(class.tier, SafetyTier::Forbidden);
    assert_eq!(class.rule, MatchedRule::Unresolvable);
}

#[test]
fn companion_pid_is_protected() {
    let c = classifier().with_protected_pid(777);
    let d = desc(777, "firefox", Some("/home/ana/firefox"));
    assert_eq!(c.classify(&d, Some(USER)).rule, MatchedRule::SelfProtection);
}

#[test]
fn extra_protected_names_from_config_apply() {
    let tables = PolicyTables::linux().with_protected_names(["backupd-critical"]);
    let c = SafetyClassifier::new(tables, 1);
    let d = desc(700, "BACKUPD-CRITICAL", Some("/opt/b/backupd-critical"));
    assert_eq!(c.classify(&d, Some(USER)).tier, SafetyTier::Forbidden);
}

#[test]
fn classification_reflects_fresh_descriptor() {
    let host = InMemoryHost::new();
    let c = classifier();
    host.insert(desc(800, "firefox", Some("/home/ana/firefox")));
    let (_, before) = c.classify_pid(&host, 800, Some(USER));
    assert_eq!(before.tier, SafetyTier::Safe);

    // Same pid now belongs to a different program.
    host.remove(800);
    host.insert(desc(800, "systemd-udevd", Some("/usr/lib/systemd/systemd-udevd")));
    let (_, after) = c.classify_pid(&host, 800, Some(USER));
    assert_eq!(after.tier, SafetyTier::Forbidden);
}
