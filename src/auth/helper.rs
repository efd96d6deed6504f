//! Helper service status and the installer abstraction.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Installation state of the privileged helper.
///
/// Only [`Installed`](Self::Installed) is operational. `Compromised` stays
/// until the helper is reinstalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperServiceStatus {
    /// No helper on this machine.
    NotInstalled,
    /// An install is in progress.
    Installing,
    /// Installed and matching this build.
    Installed,
    /// Installed but from a different build.
    Outdated,
    /// Installed binary failed integrity checks.
    Compromised,
}

impl HelperServiceStatus {
    /// Lowercase label used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Outdated => "outdated",
            Self::Compromised => "compromised",
        }
    }

    /// Whether the helper can serve requests.
    pub fn is_operational(self) -> bool {
        self == Self::Installed
    }
}

impl std::fmt::Display for HelperServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperProbe {
    /// Derived status.
    pub status: HelperServiceStatus,
    /// Human-readable detail.
    pub detail: String,
}

impl HelperProbe {
    /// Probe result with a detail line.
    pub fn new(status: HelperServiceStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

/// Errors from helper installation.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    /// The user dismissed the OS authentication dialog.
    #[error("administrator authentication was declined")]
    ElevationDeclined,

    /// The helper binary to install is missing.
    #[error("helper binary not found at {0}")]
    SourceMissing(PathBuf),

    /// An install step exited unsuccessfully.
    #[error("{command} failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        /// Program that failed.
        command: &'static str,
        /// Exit code, if any.
        code: Option<i32>,
        /// Captured stderr (trimmed).
        stderr: String,
    },

    /// Filesystem error while staging files.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No installer for this platform.
    #[error("helper installation is not supported on this platform")]
    Unsupported,
}

/// Installs, removes and inspects the privileged helper.
#[async_trait]
pub trait HelperInstaller: Send + Sync {
    /// Install (or reinstall) the helper. May prompt for OS credentials.
    async fn install(&self) -> Result<(), HelperError>;

    /// Remove the helper.
    async fn uninstall(&self) -> Result<(), HelperError>;

    /// Derive the helper's status from what is on disk.
    async fn probe(&self) -> HelperProbe;
}

// ---------------------------------------------------------------------------
// Static installer
// ---------------------------------------------------------------------------

/// In-memory installer for simulation and tests.
#[derive(Debug)]
pub struct StaticInstaller {
    status: Mutex<HelperServiceStatus>,
    fail_install: bool,
    delay: Option<Duration>,
    installs: AtomicUsize,
}

impl StaticInstaller {
    /// Installer whose probe starts at `initial`.
    pub fn new(initial: HelperServiceStatus) -> Self {
        Self {
            status: Mutex::new(initial),
            fail_install: false,
            delay: None,
            installs: AtomicUsize::new(0),
        }
    }

    /// Every install fails.
    pub fn failing(mut self) -> Self {
        self.fail_install = true;
        self
    }

    /// Installs take `delay` before finishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Overwrite what the next probe reports.
    pub fn set_status(&self, status: HelperServiceStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    /// Number of completed install attempts.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HelperInstaller for StaticInstaller {
    async fn install(&self) -> Result<(), HelperError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail_install {
            return Err(HelperError::ElevationDeclined);
        }
        self.set_status(HelperServiceStatus::Installed);
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), HelperError> {
        self.set_status(HelperServiceStatus::NotInstalled);
        Ok(())
    }

    async fn probe(&self) -> HelperProbe {
        let status = self
            .status
            .lock()
            .map(|s| *s)
            .unwrap_or(HelperServiceStatus::Compromised);
        HelperProbe::new(status, "static installer")
    }
}
