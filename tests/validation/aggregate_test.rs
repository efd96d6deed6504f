//! Tests for `aggregate` in `src/validation/mod.rs`.

use proptest::prelude::*;

use forcequit::validation::{aggregate, RulePriority, RuleResult, SecurityState};

fn result(id: &str, priority: RulePriority, passed: bool) -> RuleResult {
    RuleResult {
        rule_id: id.to_owned(),
        priority,
        passed,
        detail: String::new(),
    }
}

#[test]
fn all_passing_is_secure() {
    let results = vec![
        result("a", RulePriority::Critical, true),
        result("b", RulePriority::High, true),
        result("c", RulePriority::Low, true),
    ];
    assert_eq!(aggregate(&results), SecurityState::Secure);
}

#[test]
fn one_low_failure_degrades() {
    let results = vec![
        result("a", RulePriority::Critical, true),
        result("b", RulePriority::Low, false),
    ];
    assert_eq!(aggregate(&results), SecurityState::Degraded);
}

#[test]
fn single_high_failure_degrades() {
    let results = vec![
        result("a", RulePriority::High, false),
        result("b", RulePriority::High, true),
    ];
    assert_eq!(aggregate(&results), SecurityState::Degraded);
}

#[test]
fn two_high_failures_compromise() {
    let results = vec![
        result("a", RulePriority::High, false),
        result("b", RulePriority::High, false),
        result("c", RulePriority::Medium, true),
    ];
    let state = aggregate(&results);
    assert_eq!(state, SecurityState::Compromised);
    assert!(state.blocks_system_privilege());
}

#[test]
fn critical_failure_wins() {
    let results = vec![
        result("a", RulePriority::High, false),
        result("b", RulePriority::High, false),
        result("c", RulePriority::Critical, false),
    ];
    assert_eq!(aggregate(&results), SecurityState::Critical);
}

#[test]
fn degraded_does_not_block() {
    assert!(!SecurityState::Degraded.blocks_system_privilege());
    assert!(!SecurityState::Secure.blocks_system_privilege());
}

fn arb_result() -> impl Strategy<Value = RuleResult> {
    (
        "[a-z]{1,8}",
        prop_oneof![
            Just(RulePriority::Low),
            Just(RulePriority::Medium),
            Just(RulePriority::High),
            Just(RulePriority::Critical),
        ],
        any::<bool>(),
    )
        .prop_map(|(id, priority, passed)| result(&id, priority, passed))
}

proptest! {
    #[test]
    fn aggregation_is_deterministic(results in proptest::collection::vec(arb_result(), 0..12)) {
        prop_assert_eq!(aggregate(&results), aggregate(&results));
    }

    #[test]
    fn any_failure_is_never_secure(
        mut results in proptest::collection::vec(arb_result(), 0..12),
        failing in arb_result(),
    ) {
        let mut failing = failing;
        failing.passed = false;
        results.push(failing);
        prop_assert_ne!(aggregate(&results), SecurityState::Secure);
    }

    #[test]
    fn failing_critical_is_always_critical(
        mut results in proptest::collection::vec(arb_result(), 0..12),
        at in 0usize..12,
    ) {
        let idx = at.min(results.len());
        results.insert(idx, result("critical", RulePriority::Critical, false));
        prop_assert_eq!(aggregate(&results), SecurityState::Critical);
    }
}
