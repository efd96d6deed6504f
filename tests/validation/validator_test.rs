//! Tests for `SecurityValidator` in `src/validation/mod.rs`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use forcequit::audit::{AuditKind, AuditLog};
use forcequit::validation::rules::StaticRule;
use forcequit::validation::{
    run_validation_loop, RulePriority, SecurityRule, SecurityState, SecurityValidator,
};

fn validator(rules: Vec<Arc<dyn SecurityRule>>, audit: &Arc<AuditLog>) -> SecurityValidator {
    SecurityValidator::new(rules, Duration::from_millis(500), Arc::clone(audit))
}

#[tokio::test]
async fn report_before_first_cycle_is_pending() {
    let audit = Arc::new(AuditLog::in_memory());
    let v = validator(Vec::new(), &audit);
    let report = v.current();
    assert!(report.evaluated_at.is_none());
    assert_eq!(report.state, SecurityState::Degraded);
}

#[tokio::test]
async fn results_keep_battery_order() {
    let audit = Arc::new(AuditLog::in_memory());
    let rules: Vec<Arc<dyn SecurityRule>> = vec![
        Arc::new(StaticRule::new("first", RulePriority::Critical, true)),
        Arc::new(StaticRule::new("second", RulePriority::Low, false)),
        Arc::new(StaticRule::new("third", RulePriority::High, true)),
    ];
    let v = validator(rules, &audit);
    let report = v.evaluate_now().await;
    let ids: Vec<&str> = report.results.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, ["first", "second", "third"]);
    assert_eq!(report.state, SecurityState::Degraded);
    assert!(report.rule_failed("second"));
    assert!(!report.rule_failed("first"));
}

#[tokio::test(start_paused = true)]
async fn slow_rule_counts_as_failed() {
    let audit = Arc::new(AuditLog::in_memory());
    let rules: Vec<Arc<dyn SecurityRule>> = vec![
        Arc::new(
            StaticRule::new("slow", RulePriority::Critical, true)
                .with_delay(Duration::from_secs(10)),
        ),
        Arc::new(StaticRule::new("fast", RulePriority::Low, true)),
    ];
    let v = validator(rules, &audit);
    let report = v.evaluate_now().await;
    assert_eq!(report.state, SecurityState::Critical);
    let slow = report
        .results
        .iter()
        .find(|r| r.rule_id == "slow")
        .expect("slow rule reported");
    assert!(!slow.passed);
    assert!(slow.detail.contains("timed out"));
}

#[tokio::test]
async fn failures_and_state_changes_are_audited() {
    let audit = Arc::new(AuditLog::in_memory());
    let rule = Arc::new(StaticRule::new("sandbox", RulePriority::High, false));
    let v = validator(vec![rule.clone() as Arc<dyn SecurityRule>], &audit);

    v.evaluate_now().await;
    let failures = audit
        .events()
        .into_iter()
        .filter(|e| matches!(&e.detail, AuditKind::RuleFailure { rule_id, .. } if rule_id == "sandbox"))
        .count();
    assert_eq!(failures, 1);

    rule.set_passing(true);
    v.evaluate_now().await;
    let states: Vec<SecurityState> = audit
        .events()
        .into_iter()
        .filter_map(|e| match e.detail {
            AuditKind::SecurityState { state } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![SecurityState::Degraded, SecurityState::Secure]);
}

#[tokio::test]
async fn subscribers_see_latest_report() {
    let audit = Arc::new(AuditLog::in_memory());
    let rule = Arc::new(StaticRule::new("binary", RulePriority::Critical, true));
    let v = validator(vec![rule.clone() as Arc<dyn SecurityRule>], &audit);
    let mut rx = v.subscribe();

    v.evaluate_now().await;
    rx.changed().await.expect("report published");
    assert_eq!(rx.borrow_and_update().state, SecurityState::Secure);

    rule.set_passing(false);
    v.evaluate_now().await;
    rx.changed().await.expect("report published");
    assert_eq!(rx.borrow().state, SecurityState::Critical);
    assert_eq!(v.current().state, SecurityState::Critical);
}

#[tokio::test(start_paused = true)]
async fn loop_reevaluates_until_shutdown() {
    let audit = Arc::new(AuditLog::in_memory());
    let rule = Arc::new(StaticRule::new("binary", RulePriority::Critical, true));
    let v = Arc::new(validator(vec![rule.clone() as Arc<dyn SecurityRule>], &audit));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run_validation_loop(
        Arc::clone(&v),
        Duration::from_secs(30),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(v.current().evaluated_at.is_some());

    rule.set_passing(false);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(v.current().state, SecurityState::Critical);

    shutdown_tx.send(true).expect("loop listening");
    task.await.expect("loop exits");
}
