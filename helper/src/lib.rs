//! ForceQuit helper, the privileged side of the termination subsystem.
//!
//! Runs as a system service, listens on a Unix domain socket, authenticates
//! each peer by the code identity of its executable, and serves termination,
//! health and restart requests after re-validating them with the same
//! classifier and capability registry the caller uses.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Peer authentication from OS credentials.
pub mod auth;
/// Configuration loading and validation.
pub mod config;
/// Per-request re-validation and dispatch.
pub mod handler;
/// Machine restart.
pub mod power;
/// Socket listener and connection lifecycle.
pub mod server;
