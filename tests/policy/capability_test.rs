//! Tests for `src/policy/capability.rs`.

use std::path::PathBuf;

use forcequit::policy::capability::{self, required_capability, RegistryError};
use forcequit::policy::{Capability, PrivilegeTier, SafetyTier};
use forcequit::process::ProcessDescriptor;

fn owned_by(uid: Option<u32>) -> ProcessDescriptor {
    ProcessDescriptor {
        pid: 10,
        name: "app".to_owned(),
        executable: Some(PathBuf::from("/home/u/app")),
        owner_uid: uid,
        parent_pid: Some(9),
        signature_valid: true,
        launch_time: 1,
        foreground: true,
    }
}

#[test]
fn registry_table_matches_requirements() {
    let user = capability::resolve(Capability::TerminateUserProcess);
    assert_eq!(user.required_tier, PrivilegeTier::Unprivileged);
    assert!(!user.requires_helper);
    assert!(!user.requires_consent);

    let system = capability::resolve(Capability::TerminateSystemProcess);
    assert_eq!(system.required_tier, PrivilegeTier::SystemPrivileged);
    assert!(system.requires_helper);
    assert!(system.requires_consent);

    let install = capability::resolve(Capability::InstallHelper);
    assert_eq!(install.required_tier, PrivilegeTier::UserElevated);
    assert!(install.requires_consent);

    let restart = capability::resolve(Capability::SystemRestart);
    assert_eq!(restart.required_tier, PrivilegeTier::SystemPrivileged);
    assert!(restart.requires_helper);
}

#[test]
fn unknown_wire_name_is_denied() {
    let err = capability::resolve_wire("format_disk").expect_err("unknown");
    assert!(matches!(err, RegistryError::Unknown(name) if name == "format_disk"));
    assert!(capability::resolve_wire("system_restart").is_ok());
}

#[test]
fn own_safe_process_needs_user_capability() {
    let cap = required_capability(&owned_by(Some(1000)), SafetyTier::Safe, Some(1000));
    assert_eq!(cap, Capability::TerminateUserProcess);
}

#[test]
fn other_users_process_needs_system_capability() {
    let cap = required_capability(&owned_by(Some(1001)), SafetyTier::Safe, Some(1000));
    assert_eq!(cap, Capability::TerminateSystemProcess);
}

#[test]
fn unknown_owner_needs_system_capability() {
    let cap = required_capability(&owned_by(None), SafetyTier::Monitored, Some(1000));
    assert_eq!(cap, Capability::TerminateSystemProcess);
}

#[test]
fn restricted_needs_system_capability_even_when_owned() {
    let cap = required_capability(&owned_by(Some(1000)), SafetyTier::Restricted, Some(1000));
    assert_eq!(cap, Capability::TerminateSystemProcess);
}

#[test]
fn fingerprint_is_stable() {
    assert_eq!(capability::fingerprint(), capability::fingerprint());
    assert_eq!(capability::fingerprint().len(), 64);
}
