//! Safety classifier: descriptor to [`SafetyTier`] plus reason.
//!
//! Rules are evaluated in a fixed order and the first match wins. The
//! classifier is pure over its inputs; callers must hand it a freshly
//! resolved descriptor for every decision.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::tables::{PolicyTables, INIT_PID};
use super::{Classification, MatchedRule, SafetyTier};
use crate::process::{ProcessDescriptor, ProcessHost};

/// uid of the superuser.
pub const ROOT_UID: u32 = 0;

/// Agent / daemon / helper naming heuristic.
static SERVICE_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i:agent|daemon|helper|service|xpc)|^[a-z][a-z0-9_-]{2,}d$").ok()
});

/// Classifies processes against a fixed set of policy tables.
#[derive(Debug, Clone)]
pub struct SafetyClassifier {
    tables: PolicyTables,
    protected_pids: BTreeSet<u32>,
}

impl SafetyClassifier {
    /// Create a classifier that always protects `self_pid`.
    pub fn new(tables: PolicyTables, self_pid: u32) -> Self {
        let mut protected_pids = BTreeSet::new();
        protected_pids.insert(self_pid);
        Self {
            tables,
            protected_pids,
        }
    }

    /// Also protect a companion process (for example the running helper).
    pub fn with_protected_pid(mut self, pid: u32) -> Self {
        self.protected_pids.insert(pid);
        self
    }

    /// Policy tables in use.
    pub fn tables(&self) -> &PolicyTables {
        &self.tables
    }

    /// Resolve `pid` through `host` and classify it. An unresolvable process
    /// classifies as [`SafetyTier::Forbidden`].
    pub fn classify_pid(
        &self,
        host: &dyn ProcessHost,
        pid: u32,
        caller_uid: Option<u32>,
    ) -> (Option<ProcessDescriptor>, Classification) {
        match host.describe(pid) {
            Some(descriptor) => {
                let classification = self.classify(&descriptor, caller_uid);
                (Some(descriptor), classification)
            }
            None => (
                None,
                Classification::new(
                    SafetyTier::Forbidden,
                    MatchedRule::Unresolvable,
                    format!("process {pid} could not be resolved"),
                ),
            ),
        }
    }

    /// Classify a resolved descriptor. `caller_uid` is the uid of whoever is
    /// asking; root-owned processes are restricted for non-root callers.
    pub fn classify(&self, desc: &ProcessDescriptor, caller_uid: Option<u32>) -> Classification {
        use SafetyTier::*;

        if self.protected_pids.contains(&desc.pid) {
            return Classification::new(
                Forbidden,
                MatchedRule::SelfProtection,
                "process belongs to the termination subsystem itself",
            );
        }

        if self.tables.is_critical_name(&desc.name) {
            return Classification::new(
                Forbidden,
                MatchedRule::CriticalName,
                format!("'{}' is a critical system process", desc.name),
            );
        }

        if let Some(exe) = desc.executable.as_deref() {
            if self.tables.is_protected_path(exe) {
                return Classification::new(
                    Forbidden,
                    MatchedRule::ProtectedPath,
                    format!("{} is under a protected system root", exe.display()),
                );
            }
        } else if self
            .tables
            .is_kernel_thread(desc.pid, desc.parent_pid, false)
        {
            return Classification::new(
                Forbidden,
                MatchedRule::KernelThread,
                "kernel thread",
            );
        }

        if !desc.signature_valid {
            return Classification::new(
                Dangerous,
                MatchedRule::InvalidSignature,
                "code signature is missing or invalid",
            );
        }

        if let Some(reason) = self.system_service_reason(desc, caller_uid) {
            return Classification::new(Restricted, MatchedRule::SystemService, reason);
        }

        if looks_like_service(&desc.name) {
            return Classification::new(
                Monitored,
                MatchedRule::ServiceName,
                format!("'{}' looks like a background agent or helper", desc.name),
            );
        }

        if let Some(exe) = desc.executable.as_deref() {
            if self.tables.is_user_path(exe) {
                return Classification::new(
                    Safe,
                    MatchedRule::UserApplication,
                    "user application",
                );
            }
        }

        if desc.foreground {
            Classification::new(Safe, MatchedRule::Default, "foreground process")
        } else {
            Classification::new(Monitored, MatchedRule::Default, "background process")
        }
    }

    fn system_service_reason(
        &self,
        desc: &ProcessDescriptor,
        caller_uid: Option<u32>,
    ) -> Option<String> {
        if let Some(exe) = desc.executable.as_deref() {
            if self.tables.is_system_path(exe) {
                return Some(format!("{} is a system binary", exe.display()));
            }
        }
        if desc.parent_pid == Some(INIT_PID) && self.tables.has_essential_keyword(&desc.name) {
            return Some(format!("'{}' is an essential system service", desc.name));
        }
        let caller_is_root = caller_uid == Some(ROOT_UID);
        if desc.owner_uid == Some(ROOT_UID) && !caller_is_root {
            return Some("process is owned by root".to_owned());
        }
        None
    }
}

/// Whether a process name matches the agent/daemon/helper heuristic.
pub fn looks_like_service(name: &str) -> bool {
    match SERVICE_NAME.as_ref() {
        Some(re) => re.is_match(name),
        // A pattern that failed to build cannot vouch for anything; treat as a service.
        None => true,
    }
}
