//! Wire messages exchanged with the helper.
//!
//! Connection sequence:
//!
//! 1. The helper authenticates the peer from OS credentials and replies
//!    [`ServerMessage::Welcome`] or [`ServerMessage::Rejected`] (then closes).
//! 2. The client sends [`ClientMessage::Hello`]; a version mismatch is
//!    answered with `Rejected` and the connection closes.
//! 3. Requests are served one at a time. Long operations stream
//!    [`ServerMessage::Progress`] frames before the final
//!    [`ServerMessage::Response`].

use serde::{Deserialize, Serialize};

use crate::terminate::{TerminationMode, TerminationOutcome};

/// Wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known socket path of the helper.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/forcequit-helper.sock";

/// Messages from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Protocol negotiation, sent once after `Welcome`.
    Hello {
        /// Client's protocol version.
        protocol_version: u32,
    },
    /// An operation request.
    Request(HelperRequest),
}

/// Operations the helper serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Liveness check.
    Ping,
    /// Terminate `target_pid`.
    Terminate,
    /// Report helper health, streaming progress.
    HealthCheck,
    /// Restart the machine.
    SystemRestart,
}

/// Optional request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParameters {
    /// Termination mode for [`Operation::Terminate`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TerminationMode>,

    /// Launch time of the instance the caller authorized. The helper
    /// refuses the request when the pid now names another instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_time: Option<u64>,
}

/// A single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperRequest {
    /// Correlation id, echoed in progress and response frames.
    pub id: u64,
    /// Requested operation.
    pub operation: Operation,
    /// Target pid, for operations that take one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pid: Option<u32>,
    /// Extra parameters.
    #[serde(default)]
    pub parameters: RequestParameters,
}

/// Why the helper refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// Peer code identity not allowed.
    Authentication,
    /// Too many concurrent connections.
    Capacity,
    /// Protocol version mismatch.
    Version,
}

/// Messages from the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Peer accepted.
    Welcome {
        /// Helper's protocol version.
        protocol_version: u32,
        /// Helper build version.
        helper_version: String,
    },
    /// Connection refused; the helper closes afterwards.
    Rejected {
        /// Category.
        kind: RejectKind,
        /// Human-readable reason.
        reason: String,
    },
    /// Intermediate progress of a long request.
    Progress(Progress),
    /// Final answer to a request.
    Response(HelperResponse),
}

/// Progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Request id.
    pub id: u64,
    /// Current stage.
    pub stage: String,
    /// Rough completion, 0 to 100.
    pub percent: u8,
}

/// Final answer to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperResponse {
    /// Request id.
    pub id: u64,
    /// Whether the request was served.
    pub success: bool,
    /// Why it was not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Termination outcome, for `Terminate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TerminationOutcome>,
    /// Health report, for `HealthCheck`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HelperHealth>,
}

impl HelperResponse {
    /// Successful response with no payload.
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            success: true,
            error: None,
            outcome: None,
            health: None,
        }
    }

    /// Refusal with a reason.
    pub fn refused(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.into()),
            outcome: None,
            health: None,
        }
    }
}

/// One health check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: String,
    /// Whether it passed.
    pub ok: bool,
    /// Detail.
    pub detail: String,
}

/// Helper health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperHealth {
    /// Helper build version.
    pub version: String,
    /// Seconds since the helper started.
    pub uptime_secs: u64,
    /// Connections currently open.
    pub active_connections: usize,
    /// Connection cap.
    pub max_connections: usize,
    /// Individual checks.
    pub checks: Vec<HealthCheck>,
}
