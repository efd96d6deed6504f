//! Security validation engine.
//!
//! A fixed battery of independent [`SecurityRule`]s runs on a timer and on
//! demand before any `SystemPrivileged` grant. Each cycle is a full
//! recomputation: results are aggregated by [`aggregate`] into a
//! [`SecurityState`] and published on a `watch` channel, last writer wins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditKind, AuditLog, Decision};

pub mod rules;

/// Actor name used in audit events from this module.
const ACTOR: &str = "validator";

// ---------------------------------------------------------------------------
// Rule types
// ---------------------------------------------------------------------------

/// How much a rule failure matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    /// Informational.
    Low,
    /// Worth attention.
    Medium,
    /// Two or more failures mean compromise.
    High,
    /// Any failure triggers lockdown.
    Critical,
}

/// Aggregated security posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityState {
    /// Every rule passed.
    Secure,
    /// Some rule failed; operations continue with warnings.
    Degraded,
    /// Two or more high-priority rules failed.
    Compromised,
    /// A critical rule failed.
    Critical,
}

impl SecurityState {
    /// Lowercase label used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Secure => "secure",
            Self::Degraded => "degraded",
            Self::Compromised => "compromised",
            Self::Critical => "critical",
        }
    }

    /// Whether `SystemPrivileged` grants are refused in this state.
    pub fn blocks_system_privilege(self) -> bool {
        matches!(self, Self::Compromised | Self::Critical)
    }
}

impl std::fmt::Display for SecurityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rule's evaluator returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    /// Whether the rule passed.
    pub passed: bool,
    /// Human-readable detail.
    pub detail: String,
}

impl RuleOutcome {
    /// Passing outcome.
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    /// Failing outcome.
    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Result of one rule in one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    /// Rule id.
    pub rule_id: String,
    /// Rule priority.
    pub priority: RulePriority,
    /// Whether the rule passed.
    pub passed: bool,
    /// Detail from the evaluator, or why it did not finish.
    pub detail: String,
}

/// An independent security check.
#[async_trait]
pub trait SecurityRule: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> &str;

    /// Failure weight.
    fn priority(&self) -> RulePriority;

    /// One-line description.
    fn description(&self) -> &str;

    /// Run the check. Must not depend on other rules.
    async fn evaluate(&self) -> RuleOutcome;
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Fold rule results into a state. Pure: identical inputs give identical
/// output, and no failure is masked by another rule passing.
pub fn aggregate(results: &[RuleResult]) -> SecurityState {
    let failed = || results.iter().filter(|r| !r.passed);
    if failed().any(|r| r.priority == RulePriority::Critical) {
        SecurityState::Critical
    } else if failed().filter(|r| r.priority == RulePriority::High).count() >= 2 {
        SecurityState::Compromised
    } else if failed().next().is_some() {
        SecurityState::Degraded
    } else {
        SecurityState::Secure
    }
}

/// One complete validation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityReport {
    /// Aggregated state.
    pub state: SecurityState,
    /// Per-rule results, in battery order.
    pub results: Vec<RuleResult>,
    /// When the cycle ran; `None` before the first cycle.
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl SecurityReport {
    /// Placeholder before the first cycle. Reported as `Degraded` because
    /// nothing has been verified yet.
    pub fn pending() -> Self {
        Self {
            state: SecurityState::Degraded,
            results: Vec::new(),
            evaluated_at: None,
        }
    }

    /// Failed results only.
    pub fn failures(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// Whether the rule with `id` failed in this cycle.
    pub fn rule_failed(&self, id: &str) -> bool {
        self.failures().any(|r| r.rule_id == id)
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Runs the rule battery and publishes reports.
pub struct SecurityValidator {
    rules: Vec<Arc<dyn SecurityRule>>,
    rule_timeout: Duration,
    audit: Arc<AuditLog>,
    tx: watch::Sender<SecurityReport>,
    // One cycle at a time; concurrent callers wait and get a fresh report.
    cycle: Mutex<()>,
}

impl SecurityValidator {
    /// Create a validator over a fixed rule battery.
    pub fn new(
        rules: Vec<Arc<dyn SecurityRule>>,
        rule_timeout: Duration,
        audit: Arc<AuditLog>,
    ) -> Self {
        let (tx, _) = watch::channel(SecurityReport::pending());
        Self {
            rules,
            rule_timeout,
            audit,
            tx,
            cycle: Mutex::new(()),
        }
    }

    /// Number of rules in the battery.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Run every rule now and publish the report.
    ///
    /// Rules run concurrently, each in its own task with its own timeout. A
    /// rule that times out or panics counts as failed.
    pub async fn evaluate_now(&self) -> SecurityReport {
        let _cycle = self.cycle.lock().await;

        let handles: Vec<_> = self
            .rules
            .iter()
            .map(|rule| {
                let rule = Arc::clone(rule);
                let timeout = self.rule_timeout;
                tokio::spawn(async move { tokio::time::timeout(timeout, rule.evaluate()).await })
            })
            .collect();

        let mut results = Vec::with_capacity(self.rules.len());
        for (rule, handle) in self.rules.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => RuleOutcome::fail(format!(
                    "timed out after {}ms",
                    self.rule_timeout.as_millis()
                )),
                Err(e) => {
                    error!(rule = rule.id(), error = %e, "security rule task failed");
                    RuleOutcome::fail("evaluator panicked")
                }
            };
            results.push(RuleResult {
                rule_id: rule.id().to_owned(),
                priority: rule.priority(),
                passed: outcome.passed,
                detail: outcome.detail,
            });
        }

        let report = SecurityReport {
            state: aggregate(&results),
            results,
            evaluated_at: Some(Utc::now()),
        };
        self.publish(&report);
        report
    }

    /// Latest published report.
    pub fn current(&self) -> SecurityReport {
        self.tx.borrow().clone()
    }

    /// Receive every future report.
    pub fn subscribe(&self) -> watch::Receiver<SecurityReport> {
        self.tx.subscribe()
    }

    fn publish(&self, report: &SecurityReport) {
        for failure in report.failures() {
            warn!(
                rule = %failure.rule_id,
                priority = ?failure.priority,
                detail = %failure.detail,
                "security rule failed"
            );
            self.audit.record(AuditEvent::new(
                ACTOR,
                Decision::Info,
                failure.detail.clone(),
                AuditKind::RuleFailure {
                    rule_id: failure.rule_id.clone(),
                    priority: failure.priority,
                },
            ));
        }

        let previous = self.tx.borrow().state;
        if previous != report.state || self.tx.borrow().evaluated_at.is_none() {
            info!(from = %previous, to = %report.state, "security state changed");
            self.audit.record(AuditEvent::new(
                ACTOR,
                Decision::Info,
                format!("security state is {}", report.state),
                AuditKind::SecurityState {
                    state: report.state,
                },
            ));
        } else {
            debug!(state = %report.state, "security state unchanged");
        }

        self.tx.send_replace(report.clone());
    }
}

impl std::fmt::Debug for SecurityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityValidator")
            .field("rules", &self.rules.iter().map(|r| r.id()).collect::<Vec<_>>())
            .field("rule_timeout", &self.rule_timeout)
            .finish()
    }
}

/// Run the battery every `interval` until shutdown.
///
/// Exits when the shutdown signal is received or the watch channel closes.
pub async fn run_validation_loop(
    validator: Arc<SecurityValidator>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "validation loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Skip the first immediate tick; startup runs its own cycle.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = validator.evaluate_now().await;
                debug!(state = %report.state, "validation cycle complete");
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("validation loop shutting down");
                    break;
                }
            }
        }
    }
}
