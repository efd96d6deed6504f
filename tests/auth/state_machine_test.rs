//! Tests for the authorization state machine in `src/auth/mod.rs`.

use std::sync::Arc;
use std::time::Duration;

use forcequit::audit::{AuditKind, AuditLog, Decision};
use forcequit::auth::{
    AuthorizationError, Authorizer, AuthorizerDeps, HelperServiceStatus, StaticConsent,
    StaticInstaller,
};
use forcequit::cancel::{cancel_pair, CancelSignal};
use forcequit::policy::{Capability, PrivilegeTier};
use forcequit::validation::rules::StaticRule;
use forcequit::validation::{RulePriority, SecurityRule, SecurityValidator};

struct Fixture {
    authorizer: Authorizer,
    consent: Arc<StaticConsent>,
    installer: Arc<StaticInstaller>,
    rules: Vec<Arc<StaticRule>>,
    audit: Arc<AuditLog>,
}

fn fixture(consent: StaticConsent, installer: StaticInstaller, rules: Vec<StaticRule>) -> Fixture {
    let audit = Arc::new(AuditLog::in_memory());
    let consent = Arc::new(consent);
    let installer = Arc::new(installer);
    let rules: Vec<Arc<StaticRule>> = rules.into_iter().map(Arc::new).collect();
    let battery: Vec<Arc<dyn SecurityRule>> = rules
        .iter()
        .map(|r| Arc::clone(r) as Arc<dyn SecurityRule>)
        .collect();
    let validator = Arc::new(SecurityValidator::new(
        battery,
        Duration::from_secs(1),
        Arc::clone(&audit),
    ));
    let authorizer = Authorizer::new(AuthorizerDeps {
        consent: consent.clone(),
        installer: installer.clone(),
        validator,
        audit: Arc::clone(&audit),
    });
    Fixture {
        authorizer,
        consent,
        installer,
        rules,
        audit,
    }
}

fn secure_battery() -> Vec<StaticRule> {
    vec![
        StaticRule::new("binary", RulePriority::Critical, true),
        StaticRule::new("signature", RulePriority::High, true),
        StaticRule::new("sandbox", RulePriority::High, true),
    ]
}

fn tier_raises(audit: &AuditLog) -> Vec<(PrivilegeTier, PrivilegeTier)> {
    audit
        .events()
        .into_iter()
        .filter_map(|e| match e.detail {
            AuditKind::TierTransition { from, to } if to > from => Some((from, to)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn user_capability_needs_no_prompt() {
    let fx = fixture(
        StaticConsent::deny_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled),
        secure_battery(),
    );
    let grant = fx
        .authorizer
        .request_capability(Capability::TerminateUserProcess)
        .await
        .expect("user capability is always granted");
    assert_eq!(grant.tier, PrivilegeTier::Unprivileged);
    assert!(!grant.elevated);
    assert_eq!(fx.consent.prompt_count(), 0);
}

#[tokio::test]
async fn declined_install_leaves_state_unchanged() {
    let fx = fixture(
        StaticConsent::deny_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled),
        secure_battery(),
    );
    let err = fx
        .authorizer
        .request_capability(Capability::TerminateSystemProcess)
        .await
        .expect_err("consent was refused");
    assert!(matches!(
        err,
        AuthorizationError::ConsentRefused {
            capability: Capability::TerminateSystemProcess
        }
    ));
    assert_eq!(fx.authorizer.current_tier(), PrivilegeTier::Unprivileged);
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::NotInstalled);
    assert_eq!(fx.installer.install_count(), 0);
    assert!(tier_raises(&fx.audit).is_empty());

    let denied = fx.audit.events().into_iter().any(|e| {
        e.decision == Decision::Denied
            && e.capability == Some(Capability::TerminateSystemProcess)
            && e.detail == AuditKind::CapabilityRequest
    });
    assert!(denied, "denial must be audited");
}

#[tokio::test]
async fn approved_elevation_installs_helper_and_audits_each_raise() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled),
        secure_battery(),
    );
    let grant = fx
        .authorizer
        .request_capability(Capability::TerminateSystemProcess)
        .await
        .expect("approved");
    assert!(grant.elevated);
    assert_eq!(grant.tier, PrivilegeTier::SystemPrivileged);
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::Installed);
    assert_eq!(fx.installer.install_count(), 1);

    // Every tier increase has exactly one matching audit record.
    assert_eq!(
        tier_raises(&fx.audit),
        vec![
            (PrivilegeTier::Unprivileged, PrivilegeTier::UserElevated),
            (PrivilegeTier::UserElevated, PrivilegeTier::SystemPrivileged),
        ]
    );
}

#[tokio::test]
async fn consent_is_remembered_for_the_session() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::Installed),
        secure_battery(),
    );
    fx.authorizer.initialize().await;
    fx.authorizer
        .request_capability(Capability::SystemRestart)
        .await
        .expect("first grant");
    let prompts = fx.consent.prompt_count();
    let again = fx
        .authorizer
        .request_capability(Capability::SystemRestart)
        .await
        .expect("second grant");
    assert!(!again.elevated);
    assert_eq!(fx.consent.prompt_count(), prompts);
}

#[tokio::test]
async fn health_query_without_helper_is_unavailable() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled),
        secure_battery(),
    );
    let err = fx
        .authorizer
        .request_capability(Capability::QueryHelperHealth)
        .await
        .expect_err("no helper");
    assert!(matches!(err, AuthorizationError::HelperUnavailable { .. }));
    assert_eq!(fx.consent.prompt_count(), 0);
    assert!(!err.remediation().is_empty());
}

#[tokio::test]
async fn failed_install_keeps_previous_status() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled).failing(),
        secure_battery(),
    );
    let err = fx
        .authorizer
        .install_helper(CancelSignal::never())
        .await
        .expect_err("install fails");
    assert!(matches!(err, AuthorizationError::HelperUnavailable { .. }));
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::NotInstalled);
    assert_eq!(fx.authorizer.current_tier(), PrivilegeTier::Unprivileged);
}

#[tokio::test(start_paused = true)]
async fn cancelled_install_ends_not_installed() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled).with_delay(Duration::from_secs(60)),
        secure_battery(),
    );
    let (handle, signal) = cancel_pair();
    handle.cancel();
    let err = fx
        .authorizer
        .install_helper(signal)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, AuthorizationError::Cancelled { .. }));
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::NotInstalled);
    assert_eq!(fx.authorizer.current_tier(), PrivilegeTier::Unprivileged);
}

#[tokio::test]
async fn critical_failure_locks_down_and_recovery_lifts_it() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::Installed),
        secure_battery(),
    );
    fx.authorizer.initialize().await;
    fx.rules[0].set_passing(false);

    let err = fx
        .authorizer
        .request_capability(Capability::SystemRestart)
        .await
        .expect_err("lockdown");
    assert!(matches!(err, AuthorizationError::SecurityLockdown { .. }));
    assert!(fx.authorizer.snapshot().lockdown);
    assert_eq!(fx.authorizer.current_tier(), PrivilegeTier::Unprivileged);

    // Even UserElevated capabilities are refused while locked down.
    let sweep = fx
        .authorizer
        .request_capability(Capability::SweepNonEssential)
        .await;
    assert!(matches!(sweep, Err(AuthorizationError::SecurityLockdown { .. })));

    fx.rules[0].set_passing(true);
    fx.authorizer
        .request_capability(Capability::SystemRestart)
        .await
        .expect("recovered");
    assert!(!fx.authorizer.snapshot().lockdown);
}

#[tokio::test]
async fn two_high_failures_deny_system_privilege_without_lockdown() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::Installed),
        secure_battery(),
    );
    fx.authorizer.initialize().await;
    fx.rules[1].set_passing(false);
    fx.rules[2].set_passing(false);

    let err = fx
        .authorizer
        .request_capability(Capability::TerminateSystemProcess)
        .await
        .expect_err("compromised");
    assert!(matches!(err, AuthorizationError::SecurityLockdown { .. }));
    assert!(!fx.authorizer.snapshot().lockdown);

    fx.authorizer
        .request_capability(Capability::SweepNonEssential)
        .await
        .expect("user-elevated capability still allowed");
}

#[tokio::test]
async fn uninstall_requires_installed_helper() {
    for status in [HelperServiceStatus::NotInstalled, HelperServiceStatus::Outdated] {
        let fx = fixture(
            StaticConsent::approve_all(),
            StaticInstaller::new(status),
            secure_battery(),
        );
        fx.authorizer.initialize().await;
        let err = fx
            .authorizer
            .uninstall_helper(CancelSignal::never())
            .await
            .expect_err("invalid transition");
        assert!(matches!(
            err,
            AuthorizationError::InvalidHelperTransition { from, .. } if from == status
        ));
    }
}

#[tokio::test]
async fn uninstall_drops_system_privilege() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::Installed),
        secure_battery(),
    );
    fx.authorizer.initialize().await;
    fx.authorizer
        .request_capability(Capability::TerminateSystemProcess)
        .await
        .expect("granted");
    assert_eq!(fx.authorizer.current_tier(), PrivilegeTier::SystemPrivileged);

    fx.authorizer
        .uninstall_helper(CancelSignal::never())
        .await
        .expect("uninstalled");
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::NotInstalled);
    assert!(fx.authorizer.current_tier() < PrivilegeTier::SystemPrivileged);
}

#[tokio::test]
async fn compromised_helper_drops_system_privilege() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::Installed),
        secure_battery(),
    );
    fx.authorizer.initialize().await;
    fx.authorizer
        .request_capability(Capability::TerminateSystemProcess)
        .await
        .expect("granted");

    fx.authorizer.mark_helper_compromised("digest mismatch").await;
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::Compromised);
    assert_eq!(fx.authorizer.current_tier(), PrivilegeTier::UserElevated);

    let transitions = fx
        .audit
        .events()
        .into_iter()
        .filter(|e| {
            matches!(
                e.detail,
                AuditKind::HelperTransition {
                    to: HelperServiceStatus::Compromised,
                    ..
                }
            )
        })
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn reinstall_after_compromise_asks_again() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled),
        secure_battery(),
    );
    fx.authorizer
        .install_helper(CancelSignal::never())
        .await
        .expect("installed");
    assert_eq!(fx.consent.asked_for(), vec![Capability::InstallHelper]);
    assert_eq!(fx.installer.install_count(), 1);

    fx.authorizer.mark_helper_compromised("digest mismatch").await;
    fx.authorizer
        .request_capability(Capability::TerminateSystemProcess)
        .await
        .expect("approved again");

    let install_prompts = fx
        .consent
        .asked_for()
        .into_iter()
        .filter(|cap| *cap == Capability::InstallHelper)
        .count();
    assert_eq!(install_prompts, 2, "reinstall must go back through consent");
    assert_eq!(fx.installer.install_count(), 2);
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::Installed);
}

#[tokio::test]
async fn helper_capability_after_compromise_is_refused_without_consent() {
    let fx = fixture(
        StaticConsent::approve_all(),
        StaticInstaller::new(HelperServiceStatus::NotInstalled),
        secure_battery(),
    );
    fx.authorizer
        .install_helper(CancelSignal::never())
        .await
        .expect("installed");
    fx.authorizer.mark_helper_compromised("digest mismatch").await;

    fx.consent.set_approve(false);
    let err = fx
        .authorizer
        .request_capability(Capability::TerminateSystemProcess)
        .await
        .expect_err("reinstall was declined");
    assert!(matches!(err, AuthorizationError::ConsentRefused { .. }));
    assert_eq!(fx.installer.install_count(), 1);
    assert_eq!(fx.authorizer.helper_status(), HelperServiceStatus::Compromised);
}
