//! Sweep: force-quit every non-essential foreground application the caller
//! owns, leaving preserved tools (terminals and the like) running.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Orchestrator, TerminationMode, TerminationOutcome};
use crate::cancel::CancelSignal;
use crate::policy::{SafetyClassifier, SafetyTier};
use crate::process::{ProcessDescriptor, ProcessHost};

/// A process the sweep deliberately left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedProcess {
    /// Pid.
    pub pid: u32,
    /// Name.
    pub name: String,
}

/// What a sweep will touch.
#[derive(Debug, Clone, Default)]
pub struct SweepPlan {
    /// Processes to terminate.
    pub targets: Vec<ProcessDescriptor>,
    /// Candidates kept because their name marks them as essential or
    /// preserved.
    pub preserved: Vec<PreservedProcess>,
}

/// What a sweep did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// One outcome per target.
    pub terminated: Vec<TerminationOutcome>,
    /// Candidates left running.
    pub preserved: Vec<PreservedProcess>,
}

/// Select sweep targets: foreground, `Safe`, owned by the caller, and not
/// essential. A name containing an essential keyword, a critical name or a
/// preserved name is kept. The classifier already protects the caller
/// itself.
pub fn plan_sweep(
    host: &dyn ProcessHost,
    classifier: &SafetyClassifier,
    caller_uid: Option<u32>,
) -> SweepPlan {
    let mut plan = SweepPlan::default();
    for pid in host.pids() {
        let Some(desc) = host.describe(pid) else {
            continue;
        };
        if !desc.foreground || caller_uid.is_none() || desc.owner_uid != caller_uid {
            continue;
        }
        if classifier.classify(&desc, caller_uid).tier != SafetyTier::Safe {
            continue;
        }
        if classifier.tables().is_sweep_essential(&desc.name) {
            plan.preserved.push(PreservedProcess {
                pid: desc.pid,
                name: desc.name,
            });
        } else {
            plan.targets.push(desc);
        }
    }
    plan
}

impl Orchestrator {
    /// Plan and execute a sweep. Stops starting new terminations once
    /// `cancel` fires.
    pub async fn sweep(
        &self,
        mode: TerminationMode,
        caller_uid: Option<u32>,
        cancel: CancelSignal,
    ) -> SweepReport {
        let plan = plan_sweep(self.host().as_ref(), self.classifier(), caller_uid);
        info!(
            targets = plan.targets.len(),
            preserved = plan.preserved.len(),
            "sweep planned"
        );

        let mut report = SweepReport {
            terminated: Vec::with_capacity(plan.targets.len()),
            preserved: plan.preserved,
        };
        for target in plan.targets {
            if cancel.is_cancelled() {
                break;
            }
            // Terminate the instance that was planned, not whatever holds the
            // pid by now.
            let planned = self.classifier().classify(&target, caller_uid);
            let outcome = self
                .terminate_authorized(&target, &planned, mode, caller_uid, cancel.clone())
                .await;
            report.terminated.push(outcome);
        }
        report
    }
}
