//! Persisted state hint (`state.json`).
//!
//! The hint records the last known helper status and privilege tier so the
//! CLI can report them. It is never trusted: on startup the helper status is
//! re-probed and the tier resets to [`PrivilegeTier::Unprivileged`].

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::HelperServiceStatus;
use crate::policy::PrivilegeTier;

/// Last-known state written at shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHint {
    /// Helper status at the time of writing.
    pub helper_status: HelperServiceStatus,
    /// Privilege tier at the time of writing.
    pub last_tier: PrivilegeTier,
    /// When the hint was written.
    pub saved_at: DateTime<Utc>,
}

impl StateHint {
    /// Snapshot stamped now.
    pub fn new(helper_status: HelperServiceStatus, last_tier: PrivilegeTier) -> Self {
        Self {
            helper_status,
            last_tier,
            saved_at: Utc::now(),
        }
    }
}

/// Write the hint atomically (temp file then rename).
///
/// # Errors
///
/// Returns an error if serialization or any filesystem step fails.
pub async fn save_hint(hint: &StateHint, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(hint).context("failed to serialize state hint")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .context("failed to write state temp file")?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("failed to rename state temp file")?;

    debug!("state.json updated");
    Ok(())
}

/// Read the hint. Missing or corrupt files yield `None`.
pub async fn load_hint(path: &Path) -> Option<StateHint> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state hint");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(hint) => Some(hint),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt state hint");
            None
        }
    }
}
