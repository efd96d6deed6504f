//! Process descriptors and the host abstraction used to inspect and signal
//! running processes.
//!
//! Descriptors are immutable snapshots. Callers re-resolve them through a
//! [`ProcessHost`] for every decision; nothing in this crate caches a
//! descriptor across a privilege or termination decision.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod memory;
pub mod signature;
pub mod sysinfo_host;

/// Structured snapshot of a running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// Process id.
    pub pid: u32,
    /// Process (or bundle) name as reported by the OS.
    pub name: String,
    /// Path of the executable image. `None` for kernel threads or when the
    /// path cannot be read with the caller's privileges.
    pub executable: Option<PathBuf>,
    /// Numeric id of the owning user, when known.
    pub owner_uid: Option<u32>,
    /// Parent process id, when known.
    pub parent_pid: Option<u32>,
    /// Whether the executable's code signature verified.
    pub signature_valid: bool,
    /// Launch time in seconds since the Unix epoch.
    pub launch_time: u64,
    /// Whether the process is attached to the interactive session
    /// (owns a visible window or was started from one).
    pub foreground: bool,
}

impl ProcessDescriptor {
    /// Returns `true` when `other` describes the same process instance
    /// (same pid and same launch time), guarding against pid reuse.
    pub fn same_instance(&self, other: &ProcessDescriptor) -> bool {
        self.pid == other.pid && self.launch_time == other.launch_time
    }
}

/// Termination signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermSignal {
    /// Polite shutdown request (`SIGTERM`).
    Graceful,
    /// Unconditional kill (`SIGKILL`).
    Forced,
}

/// Errors from host process operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The process does not exist (or already exited).
    #[error("process {pid} not found")]
    NotFound {
        /// Target process id.
        pid: u32,
    },

    /// The OS refused to deliver the signal.
    #[error("permission denied signalling process {pid}")]
    PermissionDenied {
        /// Target process id.
        pid: u32,
    },

    /// The signal is not supported on this platform.
    #[error("signal {signal:?} is not supported on this platform")]
    Unsupported {
        /// Requested signal.
        signal: TermSignal,
    },
}

/// Read/signal access to the host's process table.
///
/// Implementations must answer every call from live OS state; they may not
/// serve descriptors from a cache.
pub trait ProcessHost: Send + Sync {
    /// Resolve a fresh descriptor for `pid`, or `None` if it cannot be resolved.
    fn describe(&self, pid: u32) -> Option<ProcessDescriptor>;

    /// List the pids currently present in the process table.
    fn pids(&self) -> Vec<u32>;

    /// Whether `pid` is still running (zombies count as exited).
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver a termination signal to `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the process is gone or the signal cannot be sent.
    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), HostError>;
}
