//! Safety classification and the capability registry.
//!
//! The classifier decides how freely a process may be terminated; the
//! registry maps each privileged operation to the tier, helper, and consent
//! it requires. Both read from tables that are fixed once constructed: there
//! is no API that removes or weakens an entry after startup.

use serde::{Deserialize, Serialize};

pub mod capability;
pub mod classifier;
pub mod tables;

pub use capability::{Capability, CapabilitySpec, RegistryError};
pub use classifier::SafetyClassifier;
pub use tables::PolicyTables;

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

/// How freely a process may be terminated, most restrictive first.
///
/// Ordering is significant: `Forbidden < Dangerous < Restricted < Monitored < Safe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyTier {
    /// Must never be terminated.
    Forbidden,
    /// Unverified code; graceful termination only.
    Dangerous,
    /// System service; forced termination only on explicit escalation.
    Restricted,
    /// Background agent or helper; terminable with care.
    Monitored,
    /// Ordinary user application.
    Safe,
}

impl SafetyTier {
    /// Lowercase label used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::Dangerous => "dangerous",
            Self::Restricted => "restricted",
            Self::Monitored => "monitored",
            Self::Safe => "safe",
        }
    }
}

impl std::fmt::Display for SafetyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller's authorization level, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTier {
    /// Ordinary user rights.
    Unprivileged,
    /// The user consented to an elevated operation in this session.
    UserElevated,
    /// Operations run through the privileged helper.
    SystemPrivileged,
}

impl PrivilegeTier {
    /// Lowercase label used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprivileged => "unprivileged",
            Self::UserElevated => "user_elevated",
            Self::SystemPrivileged => "system_privileged",
        }
    }
}

impl std::fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Classification result
// ---------------------------------------------------------------------------

/// Which classifier rule produced a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedRule {
    /// The process is this subsystem or one of its companions.
    SelfProtection,
    /// Name is on the critical-process deny-list.
    CriticalName,
    /// Executable lives under an immutable system root.
    ProtectedPath,
    /// Kernel thread with no executable image.
    KernelThread,
    /// Code signature missing or invalid.
    InvalidSignature,
    /// System binary or recognized system service.
    SystemService,
    /// Name looks like an agent, daemon, or helper.
    ServiceName,
    /// Executable lives under a user-application root.
    UserApplication,
    /// No specific rule matched; foreground/background default.
    Default,
    /// The process could not be resolved.
    Unresolvable,
}

/// Tier assigned to a process plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Assigned tier.
    pub tier: SafetyTier,
    /// Why the tier was chosen.
    pub reason: String,
    /// Rule that matched.
    pub rule: MatchedRule,
}

impl Classification {
    pub(crate) fn new(tier: SafetyTier, rule: MatchedRule, reason: impl Into<String>) -> Self {
        Self {
            tier,
            reason: reason.into(),
            rule,
        }
    }
}
