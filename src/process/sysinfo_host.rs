//! [`ProcessHost`] backed by the `sysinfo` crate.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sysinfo::{Pid, Process, ProcessStatus, Signal, System};
use tracing::{debug, warn};

use super::signature::SignatureVerifier;
use super::{HostError, ProcessDescriptor, ProcessHost, TermSignal};

/// Pid of the init / launch supervisor on Unix systems.
const INIT_PID: u32 = 1;

/// Live process table read through `sysinfo`.
///
/// Every call refreshes the queried process before answering. The
/// [`System`] handle is only a refresh buffer; no answer is served from it
/// without a refresh first.
pub struct SysinfoHost {
    system: Mutex<System>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl SysinfoHost {
    /// Create a host that verifies executables with `verifier`.
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            verifier,
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> Option<T> {
        match self.system.lock() {
            Ok(mut system) => Some(f(&mut system)),
            Err(e) => {
                warn!(error = %e, "process table lock poisoned");
                None
            }
        }
    }
}

impl ProcessHost for SysinfoHost {
    fn describe(&self, pid: u32) -> Option<ProcessDescriptor> {
        let snapshot = self
            .with_system(|system| {
                let spid = Pid::from_u32(pid);
                if !system.refresh_process(spid) {
                    return None;
                }
                let process = system.process(spid)?;
                if is_exited(process) {
                    return None;
                }
                Some(snapshot_of(pid, process))
            })
            .flatten()?;

        // Signature checks touch the filesystem; run them outside the lock.
        let signature_valid = snapshot
            .executable
            .as_deref()
            .is_some_and(|exe| self.verifier.verify(exe));

        Some(ProcessDescriptor {
            signature_valid,
            ..snapshot
        })
    }

    fn pids(&self) -> Vec<u32> {
        self.with_system(|system| {
            system.refresh_processes();
            let mut pids: Vec<u32> = system
                .processes()
                .iter()
                .filter(|(_, p)| !is_exited(p))
                .map(|(pid, _)| pid.as_u32())
                .collect();
            pids.sort_unstable();
            pids
        })
        .unwrap_or_default()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.with_system(|system| {
            let spid = Pid::from_u32(pid);
            system.refresh_process(spid) && system.process(spid).is_some_and(|p| !is_exited(p))
        })
        .unwrap_or(false)
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), HostError> {
        let delivered = self
            .with_system(|system| {
                let spid = Pid::from_u32(pid);
                if !system.refresh_process(spid) {
                    return Err(HostError::NotFound { pid });
                }
                let process = system.process(spid).ok_or(HostError::NotFound { pid })?;
                let sys_signal = match signal {
                    TermSignal::Graceful => Signal::Term,
                    TermSignal::Forced => Signal::Kill,
                };
                match process.kill_with(sys_signal) {
                    Some(true) => Ok(()),
                    Some(false) => Err(HostError::PermissionDenied { pid }),
                    None => Err(HostError::Unsupported { signal }),
                }
            })
            .ok_or(HostError::NotFound { pid })?;

        if delivered.is_ok() {
            debug!(pid, ?signal, "signal delivered");
        }
        delivered
    }
}

fn is_exited(process: &Process) -> bool {
    matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Build a descriptor from a refreshed `sysinfo` entry, without the
/// signature check.
fn snapshot_of(pid: u32, process: &Process) -> ProcessDescriptor {
    let parent_pid = process.parent().map(|p| p.as_u32());
    ProcessDescriptor {
        pid,
        name: process.name().to_owned(),
        executable: process.exe().map(PathBuf::from),
        owner_uid: owner_uid(process),
        parent_pid,
        signature_valid: false,
        launch_time: process.start_time(),
        // Session heuristic: daemons are reparented to the init supervisor,
        // interactive apps keep a session ancestor.
        foreground: parent_pid.is_some_and(|ppid| ppid != INIT_PID),
    }
}

#[cfg(unix)]
fn owner_uid(process: &Process) -> Option<u32> {
    process.user_id().map(|uid| **uid)
}

#[cfg(not(unix))]
fn owner_uid(_process: &Process) -> Option<u32> {
    None
}
