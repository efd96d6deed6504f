//! Property tests: protected markers always classify as `Forbidden`.

use std::path::PathBuf;

use proptest::prelude::*;

use forcequit::policy::{PolicyTables, SafetyClassifier, SafetyTier};
use forcequit::process::ProcessDescriptor;

const CRITICAL: &[&str] = &["systemd", "dbus-daemon", "Xorg", "kthreadd", "forcequit-helper"];
const PROTECTED_ROOTS: &[&str] = &["/usr/lib/systemd", "/lib/systemd", "/usr/lib/polkit-1"];

fn arb_descriptor() -> impl Strategy<Value = ProcessDescriptor> {
    (
        3u32..100_000,
        "[a-zA-Z][a-zA-Z0-9_-]{0,15}",
        proptest::option::of(0u32..5000),
        proptest::option::of(0u32..100_000),
        any::<bool>(),
        any::<bool>(),
        any::<u64>(),
    )
        .prop_map(|(pid, name, owner_uid, parent_pid, signature_valid, foreground, launch_time)| {
            ProcessDescriptor {
                pid,
                executable: Some(PathBuf::from(format!("/home/u/bin/{name}"))),
                name,
                owner_uid,
                parent_pid,
                signature_valid,
                launch_time,
                foreground,
            }
        })
}

proptest! {
    #[test]
    fn critical_name_is_always_forbidden(
        mut desc in arb_descriptor(),
        idx in 0..CRITICAL.len(),
        caller in proptest::option::of(0u32..5000),
    ) {
        desc.name = CRITICAL[idx].to_owned();
        let c = SafetyClassifier::new(PolicyTables::linux(), 1);
        prop_assert_eq!(c.classify(&desc, caller).tier, SafetyTier::Forbidden);
    }

    #[test]
    fn protected_path_is_always_forbidden(
        mut desc in arb_descriptor(),
        idx in 0..PROTECTED_ROOTS.len(),
        leaf in "[a-z]{1,12}",
        caller in proptest::option::of(0u32..5000),
    ) {
        desc.executable = Some(PathBuf::from(PROTECTED_ROOTS[idx]).join(leaf));
        let c = SafetyClassifier::new(PolicyTables::linux(), 1);
        prop_assert_eq!(c.classify(&desc, caller).tier, SafetyTier::Forbidden);
    }

    #[test]
    fn own_pid_is_always_forbidden(mut desc in arb_descriptor(), own in 3u32..100_000) {
        desc.pid = own;
        let c = SafetyClassifier::new(PolicyTables::linux(), own);
        prop_assert_eq!(c.classify(&desc, Some(1000)).tier, SafetyTier::Forbidden);
    }
}
