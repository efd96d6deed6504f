//! ForceQuit: process-termination authorization and privilege escalation.
//!
//! Decides, for any running process, whether and how it may be terminated,
//! and brokers elevation from the unprivileged caller to a privileged helper
//! service over an authenticated IPC channel.
//!
//! See `DESIGN.md` for the architecture and the grounding ledger.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cancel;
pub mod config;
pub mod logging;
pub mod state;

pub mod process;

pub mod policy;

pub mod auth;
pub mod ipc;
pub mod validation;

pub mod terminate;

pub mod engine;
