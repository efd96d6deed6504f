//! Capability registry: the static table of privileged operations and what
//! each one requires.
//!
//! [`resolve`] is an exhaustive `match`, so adding a [`Capability`] without
//! a table entry is a compile error. Lookups by wire name that fail are
//! denials.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::classifier::ROOT_UID;
use super::{PrivilegeTier, SafetyTier};
use crate::process::ProcessDescriptor;

/// A named, privilege-gated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Terminate a process owned by the caller.
    TerminateUserProcess,
    /// Bulk force-quit of non-essential foreground applications.
    SweepNonEssential,
    /// Install the privileged helper.
    InstallHelper,
    /// Remove the privileged helper.
    UninstallHelper,
    /// Ask the helper for its health report.
    QueryHelperHealth,
    /// Terminate a system or other-user process through the helper.
    TerminateSystemProcess,
    /// Restart the machine through the helper.
    SystemRestart,
}

impl Capability {
    /// Every capability, in registry order.
    pub const ALL: [Capability; 7] = [
        Capability::TerminateUserProcess,
        Capability::SweepNonEssential,
        Capability::InstallHelper,
        Capability::UninstallHelper,
        Capability::QueryHelperHealth,
        Capability::TerminateSystemProcess,
        Capability::SystemRestart,
    ];

    /// Wire / config name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TerminateUserProcess => "terminate_user_process",
            Self::SweepNonEssential => "sweep_non_essential",
            Self::InstallHelper => "install_helper",
            Self::UninstallHelper => "uninstall_helper",
            Self::QueryHelperHealth => "query_helper_health",
            Self::TerminateSystemProcess => "terminate_system_process",
            Self::SystemRestart => "system_restart",
        }
    }

    /// Parse a wire name. Unknown names return `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requirements of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// The capability described.
    pub capability: Capability,
    /// Minimum privilege tier.
    pub required_tier: PrivilegeTier,
    /// Whether the operation runs in the privileged helper.
    pub requires_helper: bool,
    /// Whether explicit user consent is needed.
    pub requires_consent: bool,
}

/// Registry lookup failure.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The wire name does not denote a known capability.
    #[error("unknown capability '{0}'")]
    Unknown(String),
}

/// Look up the requirements of `capability`.
pub const fn resolve(capability: Capability) -> CapabilitySpec {
    use Capability::*;
    use PrivilegeTier::*;

    let (required_tier, requires_helper, requires_consent) = match capability {
        TerminateUserProcess => (Unprivileged, false, false),
        SweepNonEssential => (UserElevated, false, true),
        InstallHelper => (UserElevated, false, true),
        UninstallHelper => (UserElevated, false, true),
        QueryHelperHealth => (Unprivileged, true, false),
        TerminateSystemProcess => (SystemPrivileged, true, true),
        SystemRestart => (SystemPrivileged, true, true),
    };

    CapabilitySpec {
        capability,
        required_tier,
        requires_helper,
        requires_consent,
    }
}

/// Look up a capability by wire name, failing closed.
///
/// # Errors
///
/// Returns [`RegistryError::Unknown`] for any name not in the registry.
pub fn resolve_wire(name: &str) -> Result<CapabilitySpec, RegistryError> {
    Capability::from_wire(name)
        .map(resolve)
        .ok_or_else(|| RegistryError::Unknown(name.to_owned()))
}

/// Capability needed to terminate `target`, given its classification.
///
/// Restricted targets and targets owned by another user need the helper.
pub fn required_capability(
    target: &ProcessDescriptor,
    tier: SafetyTier,
    caller_uid: Option<u32>,
) -> Capability {
    let other_owner = match (target.owner_uid, caller_uid) {
        (_, Some(ROOT_UID)) => false,
        (Some(owner), Some(caller)) => owner != caller,
        // Unknown ownership is treated as not ours.
        _ => true,
    };
    if tier == SafetyTier::Restricted || other_owner {
        Capability::TerminateSystemProcess
    } else {
        Capability::TerminateUserProcess
    }
}

/// SHA-256 over the whole registry table, used to detect tampering.
pub fn fingerprint() -> String {
    let mut hasher = Sha256::new();
    for cap in Capability::ALL {
        let spec = resolve(cap);
        hasher.update(cap.as_str().as_bytes());
        hasher.update(spec.required_tier.as_str().as_bytes());
        hasher.update([u8::from(spec.requires_helper), u8::from(spec.requires_consent)]);
    }
    hex::encode(hasher.finalize())
}
