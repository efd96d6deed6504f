//! Machine restart.
//!
//! Only hardcoded command names and arguments are passed to `Command`.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Errors from power operations.
#[derive(Debug, Error)]
pub enum PowerError {
    /// The restart command could not be started.
    #[error("failed to run shutdown: {0}")]
    Io(#[from] std::io::Error),

    /// The restart command exited with an error.
    #[error("shutdown exited with {code:?}")]
    Failed {
        /// Exit code, if any.
        code: Option<i32>,
    },
}

/// Restarts the machine.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Schedule an immediate restart.
    ///
    /// # Errors
    ///
    /// Returns [`PowerError`] if the restart could not be requested.
    async fn restart(&self) -> Result<(), PowerError>;
}

/// Restarts through the platform `shutdown` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPower;

#[async_trait]
impl PowerControl for SystemPower {
    async fn restart(&self) -> Result<(), PowerError> {
        info!("system restart requested");
        let status = Command::new("/sbin/shutdown")
            .args(["-r", "now"])
            .kill_on_drop(false)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(PowerError::Failed {
                code: status.code(),
            })
        }
    }
}

/// Records restart requests instead of acting on them.
#[derive(Debug, Default)]
pub struct RecordingPower {
    restarts: AtomicUsize,
}

impl RecordingPower {
    /// Number of restarts requested so far.
    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerControl for RecordingPower {
    async fn restart(&self) -> Result<(), PowerError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
