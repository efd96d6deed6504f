//! The caller-side facade.
//!
//! [`Engine`] owns the classifier, the authorization state machine, the
//! validator, the orchestrator and the helper client, all injected through
//! [`EngineDeps`]. Requests flow: classify target, pick the capability,
//! authorize, then terminate locally or through the helper.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditKind, AuditLog, Decision};
use crate::auth::{AuthSnapshot, AuthorizationError, Authorizer, Grant, HelperServiceStatus};
use crate::cancel::CancelSignal;
use crate::ipc::client::ChannelError;
use crate::ipc::protocol::{HelperHealth, Progress};
use crate::ipc::HelperClient;
use crate::policy::capability::{self, required_capability};
use crate::policy::{Capability, Classification, PrivilegeTier, SafetyClassifier, SafetyTier};
use crate::process::{ProcessDescriptor, ProcessHost};
use crate::state::{load_hint, save_hint, StateHint};
use crate::terminate::{
    record_outcome, Orchestrator, SweepReport, TerminationMode, TerminationOutcome,
    TerminationSettings,
};
use crate::validation::rules::HELPER_INTEGRITY;
use crate::validation::{run_validation_loop, SecurityReport, SecurityState, SecurityValidator};

/// Actor name for locally executed requests.
const LOCAL_ACTOR: &str = "caller";

/// Actor name for outcomes reported by the helper.
const HELPER_ACTOR: &str = "helper";

/// Errors surfaced by [`Engine`] operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The capability was not granted.
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    /// The helper could not serve the request.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl EngineError {
    /// What the user can do about it.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Authorization(e) => e.remediation(),
            Self::Channel(e) => e.remediation(),
        }
    }
}

/// Tuning for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Orchestrator timing.
    pub termination: TerminationSettings,
    /// Interval of the background validation loop.
    pub validation_interval: Duration,
    /// Where the state hint lives, if persisted.
    pub state_file: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            termination: TerminationSettings::default(),
            validation_interval: Duration::from_secs(30),
            state_file: None,
        }
    }
}

/// Collaborators of the [`Engine`].
pub struct EngineDeps {
    /// Process table.
    pub host: Arc<dyn ProcessHost>,
    /// Safety classifier.
    pub classifier: Arc<SafetyClassifier>,
    /// Authorization state machine.
    pub authorizer: Arc<Authorizer>,
    /// Security validator (shared with the authorizer).
    pub validator: Arc<SecurityValidator>,
    /// Helper channel.
    pub client: Arc<HelperClient>,
    /// Audit sink.
    pub audit: Arc<AuditLog>,
    /// uid of the caller, when known.
    pub caller_uid: Option<u32>,
    /// Tuning.
    pub settings: EngineSettings,
}

/// What startup found.
#[derive(Debug, Clone)]
pub struct StartupReport {
    /// Persisted hint from the previous run, for display only.
    pub previous: Option<StateHint>,
    /// Freshly probed helper status.
    pub helper_status: HelperServiceStatus,
    /// First security report.
    pub security: SecurityReport,
}

/// Caller-side service.
pub struct Engine {
    host: Arc<dyn ProcessHost>,
    classifier: Arc<SafetyClassifier>,
    authorizer: Arc<Authorizer>,
    validator: Arc<SecurityValidator>,
    client: Arc<HelperClient>,
    audit: Arc<AuditLog>,
    orchestrator: Orchestrator,
    caller_uid: Option<u32>,
    settings: EngineSettings,
}

impl Engine {
    /// Assemble the engine from its collaborators.
    pub fn new(deps: EngineDeps) -> Self {
        let orchestrator = Orchestrator::new(
            Arc::clone(&deps.host),
            Arc::clone(&deps.classifier),
            deps.settings.termination,
            Arc::clone(&deps.audit),
            LOCAL_ACTOR,
        );
        Self {
            host: deps.host,
            classifier: deps.classifier,
            authorizer: deps.authorizer,
            validator: deps.validator,
            client: deps.client,
            audit: deps.audit,
            orchestrator,
            caller_uid: deps.caller_uid,
            settings: deps.settings,
        }
    }

    /// Re-derive ground truth: log the persisted hint, probe the helper,
    /// reset the tier and run the first validation cycle.
    pub async fn start(&self) -> StartupReport {
        let previous = match &self.settings.state_file {
            Some(path) => load_hint(path).await,
            None => None,
        };
        if let Some(hint) = &previous {
            info!(
                helper = %hint.helper_status,
                tier = %hint.last_tier,
                saved_at = %hint.saved_at,
                "previous state hint (informational only)"
            );
        }

        self.audit.record(AuditEvent::new(
            LOCAL_ACTOR,
            Decision::Info,
            "engine started",
            AuditKind::Startup {
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        ));

        let helper_status = self.authorizer.initialize().await;
        let security = self.validator.evaluate_now().await;
        self.enforce(&security).await;

        StartupReport {
            previous,
            helper_status,
            security,
        }
    }

    /// Spawn the validation loop and the enforcement task. Both stop when
    /// `shutdown_rx` flips to `true`.
    pub fn spawn_background(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let validation = tokio::spawn(run_validation_loop(
            Arc::clone(&self.validator),
            self.settings.validation_interval,
            shutdown_rx.clone(),
        ));

        let engine = Arc::clone(self);
        let mut shutdown_rx = shutdown_rx;
        let enforcement = tokio::spawn(async move {
            let mut reports = engine.validator.subscribe();
            loop {
                tokio::select! {
                    changed = reports.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let report = reports.borrow_and_update().clone();
                        engine.enforce(&report).await;
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("enforcement task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        vec![validation, enforcement]
    }

    /// Apply a security report to the state machine and the channel.
    async fn enforce(&self, report: &SecurityReport) {
        if report.rule_failed(HELPER_INTEGRITY) {
            self.authorizer
                .mark_helper_compromised("helper integrity check failed")
                .await;
            self.client.invalidate().await;
        }
        let entered_lockdown = self.authorizer.apply_security_report(report).await;
        if report.state == SecurityState::Critical {
            if entered_lockdown {
                warn!("critical security state: helper channel invalidated");
            }
            self.client.invalidate().await;
        }
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Terminate `pid` without cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the capability is denied or the helper
    /// cannot be reached. A blocked termination is an outcome, not an error.
    pub async fn request_termination(
        &self,
        pid: u32,
        mode: TerminationMode,
    ) -> Result<TerminationOutcome, EngineError> {
        self.request_termination_with(pid, mode, CancelSignal::never())
            .await
    }

    /// Terminate `pid`, honouring `cancel` up to the forced signal.
    ///
    /// # Errors
    ///
    /// See [`request_termination`](Self::request_termination).
    pub async fn request_termination_with(
        &self,
        pid: u32,
        mode: TerminationMode,
        cancel: CancelSignal,
    ) -> Result<TerminationOutcome, EngineError> {
        let (descriptor, classification) =
            self.classifier
                .classify_pid(self.host.as_ref(), pid, self.caller_uid);

        // Protected or unresolvable: blocked with no signal and no privilege
        // involved. The pid is not resolved again.
        let descriptor = match descriptor {
            Some(descriptor) if classification.tier != SafetyTier::Forbidden => descriptor,
            other => return Ok(self.orchestrator.block(pid, other.as_ref(), classification)),
        };

        let cap = required_capability(&descriptor, classification.tier, self.caller_uid);
        let grant = self.authorize(cap, cancel.clone()).await?;
        debug!(pid, capability = %cap, tier = %grant.tier, "termination authorized");

        if !capability::resolve(cap).requires_helper {
            return Ok(self
                .orchestrator
                .terminate_authorized(&descriptor, &classification, mode, self.caller_uid, cancel)
                .await);
        }

        // The helper classifies afresh and refuses a recycled pid; once the
        // request is sent it cannot be recalled.
        let outcome = self
            .client
            .terminate_instance(&descriptor, mode)
            .await
            .map_err(|e| self.channel_failed(e))?;
        record_outcome(&self.audit, HELPER_ACTOR, &outcome);
        Ok(outcome)
    }

    /// Force-quit every non-essential foreground application the caller
    /// owns.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Authorization`] when the sweep is not granted.
    pub async fn sweep(
        &self,
        mode: TerminationMode,
        cancel: CancelSignal,
    ) -> Result<SweepReport, EngineError> {
        self.authorize(Capability::SweepNonEssential, cancel.clone())
            .await?;
        Ok(self.orchestrator.sweep(mode, self.caller_uid, cancel).await)
    }

    /// Ask the helper to restart the machine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when denied or the helper fails.
    pub async fn system_restart(&self, cancel: CancelSignal) -> Result<(), EngineError> {
        self.authorize(Capability::SystemRestart, cancel).await?;
        self.client
            .system_restart()
            .await
            .map_err(|e| self.channel_failed(e))?;
        Ok(())
    }

    /// Fetch the helper's health, forwarding progress frames.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the helper is not installed or fails.
    pub async fn helper_health(
        &self,
        progress: Option<mpsc::Sender<Progress>>,
    ) -> Result<HelperHealth, EngineError> {
        self.authorize(Capability::QueryHelperHealth, CancelSignal::never())
            .await?;
        self.client
            .health_check(progress)
            .await
            .map_err(|e| self.channel_failed(e))
    }

    // -----------------------------------------------------------------------
    // Authorization
    // -----------------------------------------------------------------------

    /// Request a capability.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] when it is not granted.
    pub async fn request_capability(&self, cap: Capability) -> Result<Grant, AuthorizationError> {
        self.authorize(cap, CancelSignal::never()).await
    }

    async fn authorize(
        &self,
        cap: Capability,
        cancel: CancelSignal,
    ) -> Result<Grant, AuthorizationError> {
        let result = self.authorizer.request_capability_with(cap, cancel).await;
        if let Err(AuthorizationError::SecurityLockdown { .. }) = &result {
            self.client.invalidate().await;
        }
        result
    }

    fn channel_failed(&self, error: ChannelError) -> EngineError {
        if let ChannelError::AuthenticationFailed(reason) = &error {
            self.audit.record(AuditEvent::new(
                LOCAL_ACTOR,
                Decision::Denied,
                format!("helper rejected this client: {reason}"),
                AuditKind::ChannelRejected { peer_pid: None },
            ));
        }
        EngineError::Channel(error)
    }

    /// Install the helper (idempotent).
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] on refusal, failure or cancellation.
    pub async fn install_helper(&self, cancel: CancelSignal) -> Result<Grant, AuthorizationError> {
        let result = self.authorizer.install_helper(cancel).await;
        self.client.invalidate().await;
        result
    }

    /// Uninstall the helper.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] on refusal, failure or cancellation.
    pub async fn uninstall_helper(&self, cancel: CancelSignal) -> Result<Grant, AuthorizationError> {
        let result = self.authorizer.uninstall_helper(cancel).await;
        self.client.invalidate().await;
        result
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Latest security state.
    pub fn current_security_state(&self) -> SecurityState {
        self.validator.current().state
    }

    /// Latest full security report.
    pub fn security_report(&self) -> SecurityReport {
        self.validator.current()
    }

    /// Current privilege tier.
    pub fn current_privilege_tier(&self) -> PrivilegeTier {
        self.authorizer.current_tier()
    }

    /// Current helper status.
    pub fn helper_status(&self) -> HelperServiceStatus {
        self.authorizer.helper_status()
    }

    /// Tier, helper status and lockdown flag together.
    pub fn snapshot(&self) -> AuthSnapshot {
        self.authorizer.snapshot()
    }

    /// Resolve and classify `pid` now.
    pub fn classify(&self, pid: u32) -> (Option<ProcessDescriptor>, Classification) {
        self.classifier
            .classify_pid(self.host.as_ref(), pid, self.caller_uid)
    }

    /// Every visible process with its classification, by pid.
    pub fn list(&self) -> Vec<(ProcessDescriptor, Classification)> {
        let mut pids = self.host.pids();
        pids.sort_unstable();
        pids.into_iter()
            .filter_map(|pid| self.host.describe(pid))
            .map(|desc| {
                let class = self.classifier.classify(&desc, self.caller_uid);
                (desc, class)
            })
            .collect()
    }

    /// Receive audit events as they are recorded. Lagging receivers lose
    /// events.
    pub fn subscribe_audit(&self) -> broadcast::Receiver<AuditEvent> {
        self.audit.subscribe()
    }

    /// Write the state hint, if a state file is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn persist_hint(&self) -> anyhow::Result<()> {
        let Some(path) = &self.settings.state_file else {
            return Ok(());
        };
        let snapshot = self.authorizer.snapshot();
        save_hint(&StateHint::new(snapshot.helper_status, snapshot.tier), path).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("caller_uid", &self.caller_uid)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
