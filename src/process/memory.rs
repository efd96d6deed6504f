//! In-memory process table for simulation and tests.
//!
//! Signals are applied to a table of simulated processes: a process exits on
//! a graceful signal unless it was inserted as one that ignores it, and on a
//! forced signal unless it ignores that too. Every delivered signal is
//! recorded so callers can assert which signals were sent.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{HostError, ProcessDescriptor, ProcessHost, TermSignal};

#[derive(Debug, Clone)]
struct Simulated {
    descriptor: ProcessDescriptor,
    ignores_graceful: bool,
    ignores_forced: bool,
}

/// Process table held in memory.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    table: Mutex<HashMap<u32, Simulated>>,
    signals: Mutex<Vec<(u32, TermSignal)>>,
}

impl InMemoryHost {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a process that exits on the first graceful signal.
    pub fn insert(&self, descriptor: ProcessDescriptor) {
        self.put(descriptor, false, false);
    }

    /// Add a process that ignores graceful signals but dies on a forced one.
    pub fn insert_stubborn(&self, descriptor: ProcessDescriptor) {
        self.put(descriptor, true, false);
    }

    /// Add a process that survives both graceful and forced signals.
    pub fn insert_unkillable(&self, descriptor: ProcessDescriptor) {
        self.put(descriptor, true, true);
    }

    /// Remove a process as if it exited on its own.
    pub fn remove(&self, pid: u32) {
        if let Ok(mut table) = self.table.lock() {
            table.remove(&pid);
        }
    }

    /// Signals delivered to `pid`, in order.
    pub fn signals_sent(&self, pid: u32) -> Vec<TermSignal> {
        self.signals
            .lock()
            .map(|log| {
                log.iter()
                    .filter(|(p, _)| *p == pid)
                    .map(|(_, s)| *s)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn put(&self, descriptor: ProcessDescriptor, ignores_graceful: bool, ignores_forced: bool) {
        if let Ok(mut table) = self.table.lock() {
            table.insert(
                descriptor.pid,
                Simulated {
                    descriptor,
                    ignores_graceful,
                    ignores_forced,
                },
            );
        }
    }
}

impl ProcessHost for InMemoryHost {
    fn describe(&self, pid: u32) -> Option<ProcessDescriptor> {
        self.table
            .lock()
            .ok()
            .and_then(|table| table.get(&pid).map(|s| s.descriptor.clone()))
    }

    fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .table
            .lock()
            .map(|table| table.keys().copied().collect())
            .unwrap_or_default();
        pids.sort_unstable();
        pids
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.table
            .lock()
            .map(|table| table.contains_key(&pid))
            .unwrap_or(false)
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), HostError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| HostError::NotFound { pid })?;
        let entry = table.get(&pid).ok_or(HostError::NotFound { pid })?;

        if let Ok(mut log) = self.signals.lock() {
            log.push((pid, signal));
        }

        let survives = match signal {
            TermSignal::Graceful => entry.ignores_graceful,
            TermSignal::Forced => entry.ignores_forced,
        };
        if !survives {
            table.remove(&pid);
        }
        Ok(())
    }
}
