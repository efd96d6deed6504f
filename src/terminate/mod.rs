//! Termination orchestrator: the graduated graceful then forced sequence.
//!
//! ```text
//! Requested -> GracefulSignalSent -> (Exited | GraceTimeout)
//!           -> [ForceSignalSent -> Exited] | Blocked
//! ```
//!
//! The safety tier decides how far the sequence may go. Cancellation is
//! honoured until the forced signal is sent; after that the outcome is never
//! `Cancelled`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditKind, AuditLog, Decision};
use crate::cancel::CancelSignal;
use crate::policy::capability::required_capability;
use crate::policy::{Classification, SafetyClassifier, SafetyTier};
use crate::process::{HostError, ProcessDescriptor, ProcessHost, TermSignal};

pub mod sweep;

pub use sweep::{plan_sweep, PreservedProcess, SweepPlan, SweepReport};

/// How far the caller allows the sequence to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMode {
    /// Graceful signal only.
    Graceful,
    /// Graceful, then forced for `Safe` and `Monitored` targets.
    #[default]
    Standard,
    /// Also force `Restricted` targets.
    Escalate,
}

/// Final status of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStatus {
    /// Exited after the graceful signal.
    ExitedGracefully,
    /// Exited after the forced signal.
    ExitedForcibly,
    /// Policy refused to go further.
    Blocked,
    /// Cancelled before the forced signal.
    Cancelled,
    /// Signalling failed or the process survived.
    Error,
}

impl TerminationStatus {
    /// Lowercase label used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExitedGracefully => "exited_gracefully",
            Self::ExitedForcibly => "exited_forcibly",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Whether the process is gone.
    pub fn exited(self) -> bool {
        matches!(self, Self::ExitedGracefully | Self::ExitedForcibly)
    }
}

impl std::fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps a request went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPhase {
    /// Request accepted and classified.
    Requested,
    /// Graceful signal delivered.
    GracefulSignalSent,
    /// Grace period elapsed with the process alive.
    GraceTimeout,
    /// Forced signal delivered.
    ForceSignalSent,
    /// Process exited.
    Exited,
    /// Policy stopped the sequence.
    Blocked,
}

/// Result of a termination request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationOutcome {
    /// Target pid.
    pub pid: u32,
    /// Target name, when it could be resolved.
    pub name: Option<String>,
    /// Tier the target was classified as.
    pub tier: SafetyTier,
    /// Why it got that tier.
    pub classification_reason: String,
    /// Final status.
    pub status: TerminationStatus,
    /// What happened.
    pub detail: String,
    /// What the user can do, for blocked or failed requests.
    pub remediation: Option<String>,
    /// Phases traversed, in order.
    pub phases: Vec<TerminationPhase>,
    /// Wall time spent.
    pub elapsed_ms: u64,
}

/// Timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationSettings {
    /// Wait after the graceful signal.
    pub grace_period: Duration,
    /// Wait after the forced signal.
    pub force_timeout: Duration,
    /// Liveness polling interval.
    pub poll_interval: Duration,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(2000),
            force_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Whether the forced signal may follow for `tier` under `mode`.
pub fn force_permitted(tier: SafetyTier, mode: TerminationMode) -> bool {
    match tier {
        SafetyTier::Forbidden | SafetyTier::Dangerous => false,
        SafetyTier::Restricted => mode == TerminationMode::Escalate,
        SafetyTier::Monitored | SafetyTier::Safe => mode != TerminationMode::Graceful,
    }
}

enum Wait {
    Exited,
    TimedOut,
    Cancelled,
}

/// Builder for one outcome; records phases as the sequence advances.
struct Run {
    pid: u32,
    name: Option<String>,
    classification: Classification,
    phases: Vec<TerminationPhase>,
    started: Instant,
}

impl Run {
    fn finish(
        self,
        status: TerminationStatus,
        detail: impl Into<String>,
        remediation: Option<&str>,
    ) -> TerminationOutcome {
        TerminationOutcome {
            pid: self.pid,
            name: self.name,
            tier: self.classification.tier,
            classification_reason: self.classification.reason,
            status,
            detail: detail.into(),
            remediation: remediation.map(str::to_owned),
            phases: self.phases,
            elapsed_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Runs termination requests against a process host.
pub struct Orchestrator {
    host: Arc<dyn ProcessHost>,
    classifier: Arc<SafetyClassifier>,
    settings: TerminationSettings,
    audit: Arc<AuditLog>,
    actor: String,
}

impl Orchestrator {
    /// Create an orchestrator. `actor` names who runs it in audit events.
    pub fn new(
        host: Arc<dyn ProcessHost>,
        classifier: Arc<SafetyClassifier>,
        settings: TerminationSettings,
        audit: Arc<AuditLog>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            host,
            classifier,
            settings,
            audit,
            actor: actor.into(),
        }
    }

    /// Process host in use.
    pub fn host(&self) -> &Arc<dyn ProcessHost> {
        &self.host
    }

    /// Classifier in use.
    pub fn classifier(&self) -> &Arc<SafetyClassifier> {
        &self.classifier
    }

    /// Terminate `pid`. The target is resolved and classified afresh.
    pub async fn terminate(
        &self,
        pid: u32,
        mode: TerminationMode,
        caller_uid: Option<u32>,
        cancel: CancelSignal,
    ) -> TerminationOutcome {
        let (descriptor, classification) =
            self.classifier
                .classify_pid(self.host.as_ref(), pid, caller_uid);
        let outcome = self.run(pid, descriptor, classification, mode, &cancel).await;
        self.record(&outcome);
        outcome
    }

    /// Terminate the exact instance that was authorized.
    ///
    /// The pid is resolved again before any signal. If it now names another
    /// instance, or the target no longer classifies to the tier and
    /// capability the grant was made for, nothing is signalled and the
    /// outcome is `Blocked`.
    pub async fn terminate_authorized(
        &self,
        target: &ProcessDescriptor,
        granted: &Classification,
        mode: TerminationMode,
        caller_uid: Option<u32>,
        cancel: CancelSignal,
    ) -> TerminationOutcome {
        let pid = target.pid;
        let (current, classification) =
            self.classifier
                .classify_pid(self.host.as_ref(), pid, caller_uid);
        let outcome = match current {
            Some(ref current) if !current.same_instance(target) => {
                recycled(pid, Some(current), classification)
            }
            Some(ref current)
                if classification.tier != granted.tier
                    || required_capability(current, classification.tier, caller_uid)
                        != required_capability(target, granted.tier, caller_uid) =>
            {
                refused(
                    pid,
                    Some(current),
                    classification,
                    "target changed since it was authorized; no signal sent",
                    "retry the request",
                )
            }
            current => self.run(pid, current, classification, mode, &cancel).await,
        };
        self.record(&outcome);
        outcome
    }

    /// Terminate `pid` only if it is still the instance launched at
    /// `launch_time`. Classification is fresh, as for
    /// [`terminate`](Self::terminate).
    pub async fn terminate_launched(
        &self,
        pid: u32,
        launch_time: u64,
        mode: TerminationMode,
        caller_uid: Option<u32>,
        cancel: CancelSignal,
    ) -> TerminationOutcome {
        let (current, classification) =
            self.classifier
                .classify_pid(self.host.as_ref(), pid, caller_uid);
        let outcome = match current {
            Some(ref current) if current.launch_time != launch_time => {
                recycled(pid, Some(current), classification)
            }
            current => self.run(pid, current, classification, mode, &cancel).await,
        };
        self.record(&outcome);
        outcome
    }

    /// Record a `Blocked` outcome for a target refused before any signal,
    /// without resolving the pid again.
    pub fn block(
        &self,
        pid: u32,
        descriptor: Option<&ProcessDescriptor>,
        classification: Classification,
    ) -> TerminationOutcome {
        let outcome = refused(
            pid,
            descriptor,
            classification,
            PROTECTED_DETAIL,
            PROTECTED_REMEDIATION,
        );
        self.record(&outcome);
        outcome
    }

    async fn run(
        &self,
        pid: u32,
        descriptor: Option<ProcessDescriptor>,
        classification: Classification,
        mode: TerminationMode,
        cancel: &CancelSignal,
    ) -> TerminationOutcome {
        let mut run = Run {
            pid,
            name: descriptor.as_ref().map(|d| d.name.clone()),
            classification,
            phases: vec![TerminationPhase::Requested],
            started: Instant::now(),
        };
        let tier = run.classification.tier;

        let Some(descriptor) = descriptor.filter(|_| tier != SafetyTier::Forbidden) else {
            run.phases.push(TerminationPhase::Blocked);
            return run.finish(
                TerminationStatus::Blocked,
                PROTECTED_DETAIL,
                Some(PROTECTED_REMEDIATION),
            );
        };

        if cancel.is_cancelled() {
            return run.finish(TerminationStatus::Cancelled, "cancelled before any signal", None);
        }

        match self.host.signal(pid, TermSignal::Graceful) {
            Ok(()) => run.phases.push(TerminationPhase::GracefulSignalSent),
            Err(HostError::NotFound { .. }) => {
                run.phases.push(TerminationPhase::Exited);
                return run.finish(
                    TerminationStatus::ExitedGracefully,
                    "process exited before it was signalled",
                    None,
                );
            }
            Err(e) => return signal_error(run, &e),
        }

        match self.wait_for_exit(&descriptor, self.settings.grace_period, cancel).await {
            Wait::Exited => {
                run.phases.push(TerminationPhase::Exited);
                return run.finish(
                    TerminationStatus::ExitedGracefully,
                    "exited after graceful signal",
                    None,
                );
            }
            Wait::Cancelled => {
                return run.finish(
                    TerminationStatus::Cancelled,
                    "cancelled during grace period; no forced signal sent",
                    None,
                );
            }
            Wait::TimedOut => run.phases.push(TerminationPhase::GraceTimeout),
        }

        if !force_permitted(tier, mode) {
            run.phases.push(TerminationPhase::Blocked);
            let (detail, remediation) = blocked_reason(tier, mode);
            return run.finish(TerminationStatus::Blocked, detail, Some(remediation));
        }

        if cancel.is_cancelled() {
            return run.finish(
                TerminationStatus::Cancelled,
                "cancelled before forced signal",
                None,
            );
        }

        // The pid may have been recycled while we waited.
        if !self.same_process_alive(&descriptor) {
            run.phases.push(TerminationPhase::Exited);
            return run.finish(
                TerminationStatus::ExitedGracefully,
                "exited at the end of the grace period",
                None,
            );
        }

        // Irrevocable from here: never report Cancelled.
        match self.host.signal(pid, TermSignal::Forced) {
            Ok(()) => run.phases.push(TerminationPhase::ForceSignalSent),
            Err(HostError::NotFound { .. }) => {
                run.phases.push(TerminationPhase::Exited);
                return run.finish(
                    TerminationStatus::ExitedGracefully,
                    "exited before forced signal",
                    None,
                );
            }
            Err(e) => return signal_error(run, &e),
        }

        match self
            .wait_for_exit(&descriptor, self.settings.force_timeout, &CancelSignal::never())
            .await
        {
            Wait::Exited => {
                run.phases.push(TerminationPhase::Exited);
                run.finish(
                    TerminationStatus::ExitedForcibly,
                    "exited after forced signal",
                    None,
                )
            }
            Wait::TimedOut | Wait::Cancelled => run.finish(
                TerminationStatus::Error,
                "process survived the forced signal",
                Some("the process may be stuck in an uninterruptible state; retry later"),
            ),
        }
    }

    fn same_process_alive(&self, original: &ProcessDescriptor) -> bool {
        self.host.is_alive(original.pid)
            && self
                .host
                .describe(original.pid)
                .is_some_and(|current| current.same_instance(original))
    }

    async fn wait_for_exit(
        &self,
        descriptor: &ProcessDescriptor,
        limit: Duration,
        cancel: &CancelSignal,
    ) -> Wait {
        let started = Instant::now();
        loop {
            if !self.same_process_alive(descriptor) {
                return Wait::Exited;
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Wait::TimedOut;
            }
            let nap = self.settings.poll_interval.min(limit.saturating_sub(elapsed));
            tokio::select! {
                () = tokio::time::sleep(nap) => {}
                () = cancel.cancelled() => return Wait::Cancelled,
            }
        }
    }

    fn record(&self, outcome: &TerminationOutcome) {
        record_outcome(&self.audit, &self.actor, outcome);
    }
}

/// Log and audit a termination outcome, wherever it was produced.
pub fn record_outcome(audit: &AuditLog, actor: &str, outcome: &TerminationOutcome) {
    let decision = match outcome.status {
        TerminationStatus::ExitedGracefully | TerminationStatus::ExitedForcibly => {
            Decision::Granted
        }
        TerminationStatus::Blocked => Decision::Blocked,
        TerminationStatus::Cancelled | TerminationStatus::Error => Decision::Denied,
    };
    if outcome.status == TerminationStatus::Error {
        warn!(pid = outcome.pid, actor, detail = %outcome.detail, "termination failed");
    } else {
        info!(
            pid = outcome.pid,
            actor,
            tier = %outcome.tier,
            status = %outcome.status,
            elapsed_ms = outcome.elapsed_ms,
            "termination finished"
        );
    }
    audit.record(AuditEvent::new(
        actor,
        decision,
        format!("{} ({})", outcome.detail, outcome.classification_reason),
        AuditKind::Termination {
            pid: outcome.pid,
            tier: outcome.tier,
            status: outcome.status,
        },
    ));
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("actor", &self.actor)
            .finish()
    }
}

const PROTECTED_DETAIL: &str = "protected process: no signal sent";
const PROTECTED_REMEDIATION: &str = "this process is protected and cannot be terminated";

/// `Blocked` before any signal.
fn refused(
    pid: u32,
    descriptor: Option<&ProcessDescriptor>,
    classification: Classification,
    detail: &str,
    remediation: &str,
) -> TerminationOutcome {
    Run {
        pid,
        name: descriptor.map(|d| d.name.clone()),
        classification,
        phases: vec![TerminationPhase::Requested, TerminationPhase::Blocked],
        started: Instant::now(),
    }
    .finish(TerminationStatus::Blocked, detail, Some(remediation))
}

fn recycled(
    pid: u32,
    current: Option<&ProcessDescriptor>,
    classification: Classification,
) -> TerminationOutcome {
    refused(
        pid,
        current,
        classification,
        "pid now belongs to a different process; no signal sent",
        "list processes again and retry",
    )
}

fn signal_error(run: Run, error: &HostError) -> TerminationOutcome {
    let remediation = match error {
        HostError::PermissionDenied { .. } => "requires helper installation for processes you do not own",
        _ => "retry, or report the platform to the maintainers",
    };
    run.finish(TerminationStatus::Error, error.to_string(), Some(remediation))
}

fn blocked_reason(tier: SafetyTier, mode: TerminationMode) -> (&'static str, &'static str) {
    match (tier, mode) {
        (SafetyTier::Dangerous, _) => (
            "unverified code ignored the graceful signal; forced termination not permitted",
            "quit the application from its own UI",
        ),
        (SafetyTier::Restricted, _) => (
            "system service ignored the graceful signal; forced termination needs escalation",
            "retry with escalate mode",
        ),
        _ => (
            "still running after the grace period; forced termination not requested",
            "retry with standard mode",
        ),
    }
}
