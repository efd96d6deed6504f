//! Tests for `src/terminate/sweep.rs`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forcequit::audit::AuditLog;
use forcequit::cancel::{cancel_pair, CancelSignal};
use forcequit::policy::{PolicyTables, SafetyClassifier};
use forcequit::process::memory::InMemoryHost;
use forcequit::process::{ProcessDescriptor, ProcessHost};
use forcequit::terminate::{
    plan_sweep, Orchestrator, TerminationMode, TerminationSettings, TerminationStatus,
};

const USER: u32 = 1000;
const SELF_PID: u32 = 4242;

fn proc(pid: u32, name: &str, owner: u32, foreground: bool) -> ProcessDescriptor {
    ProcessDescriptor {
        pid,
        name: name.to_owned(),
        executable: Some(PathBuf::from(format!("/home/ana/apps/{name}"))),
        owner_uid: Some(owner),
        parent_pid: Some(900),
        signature_valid: true,
        launch_time: 1_700_000_000,
        foreground,
    }
}

fn populated() -> Arc<InMemoryHost> {
    let host = Arc::new(InMemoryHost::new());
    host.insert(proc(10, "browser", USER, true));
    host.insert(proc(11, "music-player", USER, true));
    host.insert(proc(12, "kitty", USER, true));
    host.insert(proc(13, "tmux", USER, true));
    host.insert(proc(14, "indexer", USER, false));
    host.insert(proc(15, "browser", 1001, true));
    host.insert(proc(SELF_PID, "forcequit", USER, true));
    host
}

fn classifier() -> SafetyClassifier {
    SafetyClassifier::new(PolicyTables::linux(), SELF_PID)
}

#[test]
fn plan_targets_only_own_foreground_apps() {
    let host = populated();
    let plan = plan_sweep(host.as_ref(), &classifier(), Some(USER));

    let targets: Vec<u32> = plan.targets.iter().map(|d| d.pid).collect();
    assert_eq!(targets, vec![10, 11]);

    let mut preserved: Vec<&str> = plan.preserved.iter().map(|p| p.name.as_str()).collect();
    preserved.sort_unstable();
    assert_eq!(preserved, vec!["kitty", "tmux"]);
}

#[test]
fn plan_without_caller_uid_is_empty() {
    let host = populated();
    let plan = plan_sweep(host.as_ref(), &classifier(), None);
    assert!(plan.targets.is_empty());
}

#[test]
fn configured_preserved_names_are_kept() {
    let host = populated();
    let tables = PolicyTables::linux().with_preserved_names(["music-player"]);
    let plan = plan_sweep(host.as_ref(), &SafetyClassifier::new(tables, SELF_PID), Some(USER));
    let targets: Vec<u32> = plan.targets.iter().map(|d| d.pid).collect();
    assert_eq!(targets, vec![10]);
}

#[tokio::test(start_paused = true)]
async fn sweep_terminates_targets_and_spares_the_rest() {
    let host = populated();
    let orch = Orchestrator::new(
        host.clone(),
        Arc::new(classifier()),
        TerminationSettings::default(),
        Arc::new(AuditLog::in_memory()),
        "caller",
    );

    let report = orch
        .sweep(TerminationMode::Standard, Some(USER), CancelSignal::never())
        .await;

    assert_eq!(report.terminated.len(), 2);
    assert!(report
        .terminated
        .iter()
        .all(|o| o.status == TerminationStatus::ExitedGracefully));
    for pid in [12, 13, 14, 15, SELF_PID] {
        assert!(host.is_alive(pid), "pid {pid} must survive the sweep");
    }
    assert!(!host.is_alive(10));
    assert!(!host.is_alive(11));
}

#[tokio::test(start_paused = true)]
async fn cancelled_sweep_starts_nothing_new() {
    let host = populated();
    let orch = Orchestrator::new(
        host.clone(),
        Arc::new(classifier()),
        TerminationSettings {
            grace_period: Duration::from_secs(1),
            ..TerminationSettings::default()
        },
        Arc::new(AuditLog::in_memory()),
        "caller",
    );
    let (handle, signal) = cancel_pair();
    handle.cancel();

    let report = orch.sweep(TerminationMode::Standard, Some(USER), signal).await;
    assert!(report.terminated.is_empty());
    assert!(host.is_alive(10));
    assert!(host.is_alive(11));
}

#[test]
fn names_with_essential_fragments_are_preserved() {
    let host = Arc::new(InMemoryHost::new());
    let system_app = |pid: u32, name: &str| ProcessDescriptor {
        executable: Some(PathBuf::from(format!("/usr/bin/{name}"))),
        ..proc(pid, name, USER, true)
    };
    host.insert(system_app(20, "gnome-system-monitor"));
    host.insert(system_app(21, "blueman-bluetooth-manager"));
    host.insert(system_app(22, "NetworkManager-applet"));
    host.insert(proc(23, "kitty-launcher", USER, true));
    host.insert(proc(24, "browser", USER, true));

    let plan = plan_sweep(host.as_ref(), &classifier(), Some(USER));

    let targets: Vec<u32> = plan.targets.iter().map(|d| d.pid).collect();
    assert_eq!(targets, vec![24]);
    let mut preserved: Vec<u32> = plan.preserved.iter().map(|p| p.pid).collect();
    preserved.sort_unstable();
    assert_eq!(preserved, vec![20, 21, 22, 23]);
}
