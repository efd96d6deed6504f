//! Append-only audit trail.
//!
//! Every authorization decision, tier or helper transition, termination
//! outcome, rule failure and channel rejection becomes one [`AuditEvent`].
//! Events are written as JSON lines to the sink and fanned out on a
//! broadcast channel. Delivery to subscribers is fire-and-forget: a lagging
//! subscriber loses events and nothing flows back.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::auth::HelperServiceStatus;
use crate::policy::{Capability, PrivilegeTier, SafetyTier};
use crate::terminate::TerminationStatus;
use crate::validation::{RulePriority, SecurityState};

/// Broadcast buffer per subscriber.
const BROADCAST_CAPACITY: usize = 256;

/// Events kept in memory for [`AuditLog::events`].
const RECENT_CAPACITY: usize = 1024;

/// Outcome recorded by an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Request granted or transition applied.
    Granted,
    /// Request denied.
    Denied,
    /// Policy blocked the operation.
    Blocked,
    /// Informational record.
    Info,
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    /// A capability was requested.
    CapabilityRequest,
    /// The caller's privilege tier changed.
    TierTransition {
        /// Previous tier.
        from: PrivilegeTier,
        /// New tier.
        to: PrivilegeTier,
    },
    /// The helper's installation status changed.
    HelperTransition {
        /// Previous status.
        from: HelperServiceStatus,
        /// New status.
        to: HelperServiceStatus,
    },
    /// A termination request finished.
    Termination {
        /// Target pid.
        pid: u32,
        /// Tier the target was classified as.
        tier: SafetyTier,
        /// Final status.
        status: TerminationStatus,
    },
    /// A security rule failed.
    RuleFailure {
        /// Rule id.
        rule_id: String,
        /// Rule priority.
        priority: RulePriority,
    },
    /// Aggregated security state after a validation cycle.
    SecurityState {
        /// New state.
        state: SecurityState,
    },
    /// The helper refused an IPC client.
    ChannelRejected {
        /// Peer pid, when known.
        peer_pid: Option<u32>,
    },
    /// A component started.
    Startup {
        /// Component version.
        version: String,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event id.
    pub id: Uuid,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Who acted (`caller`, `helper`, `validator`, ...).
    pub actor: String,
    /// Capability involved, if any.
    pub capability: Option<Capability>,
    /// Decision recorded.
    pub decision: Decision,
    /// Human-readable reason.
    pub reason: String,
    /// Kind-specific payload.
    pub detail: AuditKind,
}

impl AuditEvent {
    /// Build an event stamped now.
    pub fn new(
        actor: impl Into<String>,
        decision: Decision,
        reason: impl Into<String>,
        detail: AuditKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            capability: None,
            decision,
            reason: reason.into(),
            detail,
        }
    }

    /// Attach the capability this event concerns.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }
}

/// Audit sink: JSON lines plus broadcast fan-out.
pub struct AuditLog {
    writer: Option<Mutex<Box<dyn Write + Send>>>,
    tx: broadcast::Sender<AuditEvent>,
    recent: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    /// Append to the file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create audit dir {}: {e}", parent.display())
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open audit log {}: {e}", path.display()))?;
        Ok(Self::from_writer(Box::new(file)))
    }

    /// Write to an arbitrary sink.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self::build(Some(Mutex::new(writer)))
    }

    /// Keep events in memory and on the broadcast channel only.
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    fn build(writer: Option<Mutex<Box<dyn Write + Send>>>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            writer,
            tx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    /// Record an event. Never fails: sink errors are logged and the event is
    /// still delivered to subscribers.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write_line(&event) {
            warn!(error = %e, event_id = %event.id, "failed to write audit event");
        }
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.tx.subscribe()
    }

    /// Most recent events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the sink accepts writes right now.
    pub fn sink_healthy(&self) -> bool {
        match &self.writer {
            None => true,
            Some(writer) => writer
                .lock()
                .map(|mut w| w.flush().is_ok())
                .unwrap_or(false),
        }
    }

    fn write_line(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let line = serde_json::to_string(event)?;
        let mut writer = writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("file_backed", &self.writer.is_some())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
