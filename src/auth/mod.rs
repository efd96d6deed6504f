//! Privilege / authorization state machine.
//!
//! Holds the caller's [`PrivilegeTier`], the helper's
//! [`HelperServiceStatus`] and the capabilities consented to this session.
//! Every transition goes through one async mutex and is audited. The tier
//! only rises through an explicit consent step; it falls on uninstall, on a
//! compromised helper and on a critical security report.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditKind, AuditLog, Decision};
use crate::cancel::CancelSignal;
use crate::policy::capability::{self, CapabilitySpec};
use crate::policy::{Capability, PrivilegeTier};
use crate::validation::{SecurityReport, SecurityState, SecurityValidator};

pub mod consent;
pub mod helper;
pub mod service;

pub use consent::{ConsentBroker, ConsentDecision, ConsentPrompt, ConsentRequest, StaticConsent};
pub use helper::{HelperError, HelperInstaller, HelperProbe, HelperServiceStatus, StaticInstaller};

/// Actor name used in audit events from this module.
const ACTOR: &str = "caller";

// ---------------------------------------------------------------------------
// Errors and grants
// ---------------------------------------------------------------------------

/// Why a capability request was denied.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthorizationError {
    /// Tier too low and the capability offers no consent path.
    #[error("{capability} requires {required} privileges (current: {current})")]
    InsufficientTier {
        /// Requested capability.
        capability: Capability,
        /// Tier it needs.
        required: PrivilegeTier,
        /// Tier held.
        current: PrivilegeTier,
    },

    /// The user refused or did not answer.
    #[error("consent for {capability} was not given")]
    ConsentRefused {
        /// Requested capability.
        capability: Capability,
    },

    /// The helper is needed but not available.
    #[error("{capability} requires the privileged helper: {reason}")]
    HelperUnavailable {
        /// Requested capability.
        capability: Capability,
        /// Why the helper cannot be used.
        reason: String,
    },

    /// Security validation refuses elevated operations.
    #[error("{capability} denied: security state is {state}")]
    SecurityLockdown {
        /// Requested capability.
        capability: Capability,
        /// State that caused the denial.
        state: SecurityState,
    },

    /// The caller cancelled while the request was in progress.
    #[error("{capability} request was cancelled")]
    Cancelled {
        /// Requested capability.
        capability: Capability,
    },

    /// The helper is not in a state that permits the operation.
    #[error("cannot {operation} helper while it is {from}")]
    InvalidHelperTransition {
        /// Current helper status.
        from: HelperServiceStatus,
        /// Attempted operation.
        operation: &'static str,
    },
}

impl AuthorizationError {
    /// What the user can do about it.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::InsufficientTier { .. } => "request the capability explicitly to elevate",
            Self::ConsentRefused { .. } => "retry and approve the consent prompt",
            Self::HelperUnavailable { .. } => "requires helper installation: run `forcequit helper install`",
            Self::SecurityLockdown { .. } => {
                "resolve the failing security checks shown by `forcequit status`"
            }
            Self::Cancelled { .. } => "retry the operation",
            Self::InvalidHelperTransition { .. } => "check `forcequit helper status`",
        }
    }
}

/// A granted capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Grant {
    /// The capability.
    pub capability: Capability,
    /// Tier held after the grant.
    pub tier: PrivilegeTier,
    /// Whether this request raised the tier or recorded new consent.
    pub elevated: bool,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Read-only view of the authorization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthSnapshot {
    /// Current tier.
    pub tier: PrivilegeTier,
    /// Current helper status.
    pub helper_status: HelperServiceStatus,
    /// Whether a critical report locked elevated operations out.
    pub lockdown: bool,
}

#[derive(Debug)]
struct AuthState {
    tier: PrivilegeTier,
    helper_status: HelperServiceStatus,
    consented: BTreeSet<Capability>,
    lockdown: bool,
}

impl AuthState {
    fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            tier: self.tier,
            helper_status: self.helper_status,
            lockdown: self.lockdown,
        }
    }
}

/// Collaborators of the [`Authorizer`].
pub struct AuthorizerDeps {
    /// Asks the user for consent.
    pub consent: Arc<dyn ConsentPrompt>,
    /// Installs and probes the helper.
    pub installer: Arc<dyn HelperInstaller>,
    /// Runs on demand before `SystemPrivileged` grants.
    pub validator: Arc<SecurityValidator>,
    /// Audit sink.
    pub audit: Arc<AuditLog>,
}

/// The serialized authorization state machine.
pub struct Authorizer {
    state: Mutex<AuthState>,
    snapshot: watch::Sender<AuthSnapshot>,
    consent: Arc<dyn ConsentPrompt>,
    installer: Arc<dyn HelperInstaller>,
    validator: Arc<SecurityValidator>,
    audit: Arc<AuditLog>,
}

impl Authorizer {
    /// Start at `(Unprivileged, NotInstalled)`; call [`initialize`](Self::initialize)
    /// to probe the helper.
    pub fn new(deps: AuthorizerDeps) -> Self {
        let state = AuthState {
            tier: PrivilegeTier::Unprivileged,
            helper_status: HelperServiceStatus::NotInstalled,
            consented: BTreeSet::new(),
            lockdown: false,
        };
        let (snapshot, _) = watch::channel(state.snapshot());
        Self {
            state: Mutex::new(state),
            snapshot,
            consent: deps.consent,
            installer: deps.installer,
            validator: deps.validator,
            audit: deps.audit,
        }
    }

    /// Re-derive ground truth: probe the helper and reset the tier.
    pub async fn initialize(&self) -> HelperServiceStatus {
        let probe = self.installer.probe().await;
        let mut state = self.state.lock().await;
        info!(helper = %probe.status, detail = %probe.detail, "helper probed");
        self.set_tier(&mut state, PrivilegeTier::Unprivileged, None, "startup reset");
        state.consented.clear();
        self.set_helper_status(&mut state, probe.status, &probe.detail);
        self.publish(&state);
        probe.status
    }

    /// Current tier.
    pub fn current_tier(&self) -> PrivilegeTier {
        self.snapshot.borrow().tier
    }

    /// Current helper status.
    pub fn helper_status(&self) -> HelperServiceStatus {
        self.snapshot.borrow().helper_status
    }

    /// Current state as one value.
    pub fn snapshot(&self) -> AuthSnapshot {
        *self.snapshot.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshot.subscribe()
    }

    /// Request a capability without cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] when the capability is not granted.
    pub async fn request_capability(&self, cap: Capability) -> Result<Grant, AuthorizationError> {
        self.request_capability_with(cap, CancelSignal::never()).await
    }

    /// Request a capability, abandoning any install or consent step when
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] when the capability is not granted.
    pub async fn request_capability_with(
        &self,
        cap: Capability,
        cancel: CancelSignal,
    ) -> Result<Grant, AuthorizationError> {
        let spec = capability::resolve(cap);
        let mut state = self.state.lock().await;
        let result = self.decide(&mut state, spec, &cancel).await;
        self.publish(&state);

        match &result {
            Ok(grant) => {
                debug!(capability = %cap, tier = %grant.tier, "capability granted");
                self.audit.record(
                    AuditEvent::new(
                        ACTOR,
                        Decision::Granted,
                        format!("{cap} granted at {}", grant.tier),
                        AuditKind::CapabilityRequest,
                    )
                    .with_capability(cap),
                );
            }
            Err(e) => {
                info!(capability = %cap, error = %e, "capability denied");
                self.audit.record(
                    AuditEvent::new(ACTOR, Decision::Denied, e.to_string(), AuditKind::CapabilityRequest)
                        .with_capability(cap),
                );
            }
        }
        result
    }

    async fn decide(
        &self,
        state: &mut AuthState,
        spec: CapabilitySpec,
        cancel: &CancelSignal,
    ) -> Result<Grant, AuthorizationError> {
        let cap = spec.capability;

        if spec.required_tier == PrivilegeTier::SystemPrivileged {
            let report = self.validator.evaluate_now().await;
            self.apply_report_locked(state, &report);
            if report.state.blocks_system_privilege() {
                return Err(AuthorizationError::SecurityLockdown {
                    capability: cap,
                    state: report.state,
                });
            }
            if report.state == SecurityState::Degraded {
                warn!(capability = %cap, "granting under degraded security state");
            }
        }

        if state.lockdown && spec.required_tier > PrivilegeTier::Unprivileged {
            return Err(AuthorizationError::SecurityLockdown {
                capability: cap,
                state: SecurityState::Critical,
            });
        }

        if spec.requires_helper && !state.helper_status.is_operational() {
            if !spec.requires_consent {
                return Err(AuthorizationError::HelperUnavailable {
                    capability: cap,
                    reason: format!("helper is {}", state.helper_status),
                });
            }
            self.install_locked(state, cap, cancel).await?;
        }

        let tier_ok = state.tier >= spec.required_tier;
        let consent_ok = !spec.requires_consent || state.consented.contains(&cap);
        if tier_ok && consent_ok {
            return Ok(Grant {
                capability: cap,
                tier: state.tier,
                elevated: false,
            });
        }

        if !spec.requires_consent {
            return Err(AuthorizationError::InsufficientTier {
                capability: cap,
                required: spec.required_tier,
                current: state.tier,
            });
        }

        let summary = format!("Allow {cap}? This grants {} privileges.", spec.required_tier);
        self.ask(cap, summary, spec.required_tier, cancel).await?;

        let raised = state.tier.max(spec.required_tier);
        self.set_tier(state, raised, Some(cap), "consent approved");
        state.consented.insert(cap);
        Ok(Grant {
            capability: cap,
            tier: state.tier,
            elevated: true,
        })
    }

    async fn ask(
        &self,
        cap: Capability,
        summary: String,
        elevates_to: PrivilegeTier,
        cancel: &CancelSignal,
    ) -> Result<(), AuthorizationError> {
        let request = ConsentRequest {
            capability: cap,
            summary,
            elevates_to,
        };
        let decision = tokio::select! {
            decision = self.consent.request(request) => decision,
            () = cancel.cancelled() => return Err(AuthorizationError::Cancelled { capability: cap }),
        };
        if decision.approved() {
            Ok(())
        } else {
            info!(capability = %cap, ?decision, "consent not given");
            Err(AuthorizationError::ConsentRefused { capability: cap })
        }
    }

    // -----------------------------------------------------------------------
    // Helper lifecycle
    // -----------------------------------------------------------------------

    /// Install the helper. A no-op when it is already installed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] if consent is refused, the install
    /// fails, or `cancel` fires; the status is left as it was (or
    /// `NotInstalled` on cancel).
    pub async fn install_helper(&self, cancel: CancelSignal) -> Result<Grant, AuthorizationError> {
        let mut state = self.state.lock().await;
        let result = if state.helper_status.is_operational() {
            Ok(Grant {
                capability: Capability::InstallHelper,
                tier: state.tier,
                elevated: false,
            })
        } else if state.lockdown {
            Err(AuthorizationError::SecurityLockdown {
                capability: Capability::InstallHelper,
                state: SecurityState::Critical,
            })
        } else {
            self.install_locked(&mut state, Capability::InstallHelper, &cancel)
                .await
                .map(|()| Grant {
                    capability: Capability::InstallHelper,
                    tier: state.tier,
                    elevated: true,
                })
        };
        self.publish(&state);
        result
    }

    async fn install_locked(
        &self,
        state: &mut AuthState,
        requested_for: Capability,
        cancel: &CancelSignal,
    ) -> Result<(), AuthorizationError> {
        let install_spec = capability::resolve(Capability::InstallHelper);
        if !state.consented.contains(&Capability::InstallHelper) {
            let summary = if requested_for == Capability::InstallHelper {
                "Install the ForceQuit privileged helper?".to_owned()
            } else {
                format!("{requested_for} needs the privileged helper. Install it now?")
            };
            self.ask(
                Capability::InstallHelper,
                summary,
                install_spec.required_tier,
                cancel,
            )
            .await
            .map_err(|e| match e {
                AuthorizationError::ConsentRefused { .. } => AuthorizationError::ConsentRefused {
                    capability: requested_for,
                },
                AuthorizationError::Cancelled { .. } => AuthorizationError::Cancelled {
                    capability: requested_for,
                },
                other => other,
            })?;
        }

        let previous = state.helper_status;
        self.set_helper_status(state, HelperServiceStatus::Installing, "install started");
        self.publish(state);

        let outcome = tokio::select! {
            res = self.installer.install() => Some(res),
            () = cancel.cancelled() => None,
        };

        match outcome {
            None => {
                self.set_helper_status(state, HelperServiceStatus::NotInstalled, "install cancelled");
                Err(AuthorizationError::Cancelled {
                    capability: requested_for,
                })
            }
            Some(Err(e)) => {
                warn!(error = %e, "helper install failed");
                self.set_helper_status(state, previous, "install failed");
                Err(AuthorizationError::HelperUnavailable {
                    capability: requested_for,
                    reason: e.to_string(),
                })
            }
            Some(Ok(())) => {
                let probe = self.installer.probe().await;
                self.set_helper_status(state, probe.status, &probe.detail);
                if !probe.status.is_operational() {
                    return Err(AuthorizationError::HelperUnavailable {
                        capability: requested_for,
                        reason: format!("helper is {} after install", probe.status),
                    });
                }
                let raised = state.tier.max(install_spec.required_tier);
                self.set_tier(state, raised, Some(Capability::InstallHelper), "helper installed");
                state.consented.insert(Capability::InstallHelper);
                Ok(())
            }
        }
    }

    /// Remove the helper. Only permitted from `Installed` or `Compromised`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] on an invalid transition, refused
    /// consent, cancellation, or installer failure.
    pub async fn uninstall_helper(&self, cancel: CancelSignal) -> Result<Grant, AuthorizationError> {
        let cap = Capability::UninstallHelper;
        let mut state = self.state.lock().await;
        let result = self.uninstall_locked(&mut state, &cancel).await;
        self.publish(&state);

        let (decision, reason) = match &result {
            Ok(_) => (Decision::Granted, "helper uninstalled".to_owned()),
            Err(e) => (Decision::Denied, e.to_string()),
        };
        self.audit.record(
            AuditEvent::new(ACTOR, decision, reason, AuditKind::CapabilityRequest).with_capability(cap),
        );
        result
    }

    async fn uninstall_locked(
        &self,
        state: &mut AuthState,
        cancel: &CancelSignal,
    ) -> Result<Grant, AuthorizationError> {
        let cap = Capability::UninstallHelper;
        let from = state.helper_status;
        if !matches!(
            from,
            HelperServiceStatus::Installed | HelperServiceStatus::Compromised
        ) {
            return Err(AuthorizationError::InvalidHelperTransition {
                from,
                operation: "uninstall",
            });
        }

        let spec = capability::resolve(cap);
        if !state.consented.contains(&cap) {
            self.ask(cap, "Uninstall the ForceQuit privileged helper?".to_owned(), spec.required_tier, cancel)
                .await?;
            state.consented.insert(cap);
        }

        let outcome = tokio::select! {
            res = self.installer.uninstall() => Some(res),
            () = cancel.cancelled() => None,
        };
        match outcome {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                return Err(AuthorizationError::HelperUnavailable {
                    capability: cap,
                    reason: e.to_string(),
                })
            }
            None => {
                // Partial removal is possible; re-derive what is on disk.
                let probe = self.installer.probe().await;
                self.set_helper_status(state, probe.status, "uninstall cancelled");
                return Err(AuthorizationError::Cancelled { capability: cap });
            }
        }

        self.set_helper_status(state, HelperServiceStatus::NotInstalled, "helper uninstalled");
        self.drop_helper_privileges(state, "helper uninstalled");
        Ok(Grant {
            capability: cap,
            tier: state.tier,
            elevated: false,
        })
    }

    /// Mark the helper compromised after a failed integrity check.
    pub async fn mark_helper_compromised(&self, reason: &str) {
        let mut state = self.state.lock().await;
        if state.helper_status == HelperServiceStatus::Compromised {
            return;
        }
        self.set_helper_status(&mut state, HelperServiceStatus::Compromised, reason);
        self.drop_helper_privileges(&mut state, reason);
        self.publish(&state);
    }

    // -----------------------------------------------------------------------
    // Security reports
    // -----------------------------------------------------------------------

    /// Apply a validation report. Returns `true` if it put the state
    /// machine into lockdown.
    pub async fn apply_security_report(&self, report: &SecurityReport) -> bool {
        let mut state = self.state.lock().await;
        let locked = self.apply_report_locked(&mut state, report);
        self.publish(&state);
        locked
    }

    fn apply_report_locked(&self, state: &mut AuthState, report: &SecurityReport) -> bool {
        match report.state {
            SecurityState::Critical => {
                let entering = !state.lockdown;
                if entering {
                    warn!("critical security state: entering lockdown");
                }
                state.lockdown = true;
                self.set_tier(state, PrivilegeTier::Unprivileged, None, "security lockdown");
                state.consented.clear();
                entering
            }
            _ if state.lockdown && report.evaluated_at.is_some() => {
                info!(state = %report.state, "security recovered: lifting lockdown");
                state.lockdown = false;
                self.audit.record(AuditEvent::new(
                    ACTOR,
                    Decision::Info,
                    "lockdown lifted",
                    AuditKind::SecurityState {
                        state: report.state,
                    },
                ));
                false
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn drop_helper_privileges(&self, state: &mut AuthState, reason: &str) {
        if state.tier == PrivilegeTier::SystemPrivileged {
            self.set_tier(state, PrivilegeTier::UserElevated, None, reason);
        }
        // Installing again must go back through the install prompt.
        state.consented.retain(|cap| {
            !capability::resolve(*cap).requires_helper
                && !matches!(cap, Capability::InstallHelper | Capability::UninstallHelper)
        });
    }

    fn set_tier(
        &self,
        state: &mut AuthState,
        to: PrivilegeTier,
        cap: Option<Capability>,
        reason: &str,
    ) {
        let from = state.tier;
        if from == to {
            return;
        }
        state.tier = to;
        let decision = if to > from {
            Decision::Granted
        } else {
            Decision::Info
        };
        info!(%from, %to, reason, "privilege tier changed");
        let mut event = AuditEvent::new(ACTOR, decision, reason, AuditKind::TierTransition { from, to });
        if let Some(cap) = cap {
            event = event.with_capability(cap);
        }
        self.audit.record(event);
    }

    fn set_helper_status(&self, state: &mut AuthState, to: HelperServiceStatus, reason: &str) {
        let from = state.helper_status;
        if from == to {
            return;
        }
        state.helper_status = to;
        info!(%from, %to, reason, "helper status changed");
        self.audit.record(AuditEvent::new(
            ACTOR,
            Decision::Info,
            reason,
            AuditKind::HelperTransition { from, to },
        ));
    }

    fn publish(&self, state: &AuthState) {
        self.snapshot.send_replace(state.snapshot());
    }
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
