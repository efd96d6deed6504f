//! Server-side request handling.
//!
//! Every request is re-validated here, regardless of what the caller
//! already checked: the operation maps to a capability, the capability must
//! be one the helper serves, and the client must be allowed it. Targets are
//! resolved and classified afresh by the orchestrator.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};

use forcequit::audit::{AuditEvent, AuditKind, AuditLog, Decision};
use forcequit::cancel::CancelSignal;
use forcequit::ipc::protocol::{
    HealthCheck, HelperHealth, HelperRequest, HelperResponse, Operation, Progress,
};
use forcequit::policy::capability;
use forcequit::policy::Capability;
use forcequit::terminate::Orchestrator;

use crate::auth::ClientIdentity;
use crate::power::PowerControl;

/// Connection counts reported in health responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Connections currently open.
    pub active: usize,
    /// Connection cap.
    pub max: usize,
}

/// Capability an operation exercises. `Ping` needs none.
pub fn operation_capability(operation: Operation) -> Option<Capability> {
    match operation {
        Operation::Ping => None,
        Operation::Terminate => Some(Capability::TerminateSystemProcess),
        Operation::HealthCheck => Some(Capability::QueryHelperHealth),
        Operation::SystemRestart => Some(Capability::SystemRestart),
    }
}

/// Serves authenticated requests.
pub struct RequestHandler {
    orchestrator: Orchestrator,
    power: Arc<dyn PowerControl>,
    audit: Arc<AuditLog>,
    started: Instant,
    table_fingerprint: String,
    registry_fingerprint: String,
}

impl RequestHandler {
    /// Create a handler. Policy fingerprints are captured now and compared
    /// on every health check.
    pub fn new(orchestrator: Orchestrator, power: Arc<dyn PowerControl>, audit: Arc<AuditLog>) -> Self {
        let table_fingerprint = orchestrator.classifier().tables().fingerprint();
        Self {
            orchestrator,
            power,
            audit,
            started: Instant::now(),
            table_fingerprint,
            registry_fingerprint: capability::fingerprint(),
        }
    }

    /// Serve one request. Progress for long operations is sent on `progress`.
    pub async fn handle(
        &self,
        client: &ClientIdentity,
        request: HelperRequest,
        stats: ConnectionStats,
        progress: mpsc::Sender<Progress>,
    ) -> HelperResponse {
        let id = request.id;

        if let Some(cap) = operation_capability(request.operation) {
            if let Err(reason) = self.permit(client, cap) {
                warn!(client = %client.identifier, capability = %cap, %reason, "request refused");
                self.audit.record(
                    AuditEvent::new(
                        client.identifier.clone(),
                        Decision::Denied,
                        reason.clone(),
                        AuditKind::CapabilityRequest,
                    )
                    .with_capability(cap),
                );
                return HelperResponse::refused(id, reason);
            }
        }

        match request.operation {
            Operation::Ping => HelperResponse::ok(id),
            Operation::Terminate => {
                let Some(pid) = request.target_pid else {
                    return HelperResponse::refused(id, "terminate requires target_pid");
                };
                let mode = request.parameters.mode.unwrap_or_default();
                info!(client = %client.identifier, pid, ?mode, "terminate requested");
                // Cancellation belongs to the caller's side; once here the
                // sequence runs to completion.
                let outcome = match request.parameters.launch_time {
                    Some(launch_time) => {
                        self.orchestrator
                            .terminate_launched(pid, launch_time, mode, client.uid, CancelSignal::never())
                            .await
                    }
                    None => {
                        self.orchestrator
                            .terminate(pid, mode, client.uid, CancelSignal::never())
                            .await
                    }
                };
                HelperResponse {
                    outcome: Some(outcome),
                    ..HelperResponse::ok(id)
                }
            }
            Operation::HealthCheck => {
                let health = self.health(id, stats, &progress).await;
                HelperResponse {
                    health: Some(health),
                    ..HelperResponse::ok(id)
                }
            }
            Operation::SystemRestart => {
                info!(client = %client.identifier, "restart requested");
                match self.power.restart().await {
                    Ok(()) => HelperResponse::ok(id),
                    Err(e) => HelperResponse::refused(id, e.to_string()),
                }
            }
        }
    }

    fn permit(&self, client: &ClientIdentity, cap: Capability) -> Result<(), String> {
        if !capability::resolve(cap).requires_helper {
            return Err(format!("{cap} is not served by the helper"));
        }
        if !client.allows(cap) {
            return Err(format!("client '{}' is not allowed {cap}", client.identifier));
        }
        Ok(())
    }

    async fn health(
        &self,
        id: u64,
        stats: ConnectionStats,
        progress: &mpsc::Sender<Progress>,
    ) -> HelperHealth {
        let step = |stage: &str, percent: u8| Progress {
            id,
            stage: stage.to_owned(),
            percent,
        };
        let mut checks = Vec::new();

        let _ = progress.send(step("policy tables", 0)).await;
        let tables_ok =
            self.orchestrator.classifier().tables().fingerprint() == self.table_fingerprint;
        checks.push(HealthCheck {
            name: "policy-table-integrity".to_owned(),
            ok: tables_ok,
            detail: if tables_ok {
                "fingerprint unchanged".to_owned()
            } else {
                "fingerprint changed since startup".to_owned()
            },
        });

        let _ = progress.send(step("capability registry", 33)).await;
        let registry_ok = capability::fingerprint() == self.registry_fingerprint;
        checks.push(HealthCheck {
            name: "capability-registry".to_owned(),
            ok: registry_ok,
            detail: if registry_ok {
                "fingerprint unchanged".to_owned()
            } else {
                "fingerprint changed since startup".to_owned()
            },
        });

        let _ = progress.send(step("audit sink", 66)).await;
        let audit_ok = self.audit.sink_healthy();
        checks.push(HealthCheck {
            name: "audit-sink".to_owned(),
            ok: audit_ok,
            detail: if audit_ok { "writable" } else { "write failures" }.to_owned(),
        });

        let _ = progress.send(step("done", 100)).await;
        HelperHealth {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            uptime_secs: self.started.elapsed().as_secs(),
            active_connections: stats.active,
            max_connections: stats.max,
            checks,
        }
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
