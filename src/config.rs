//! Caller-side configuration loading.
//!
//! Configuration lives in `~/.forcequit/config.toml`. Every section has
//! defaults, so a missing or empty file is valid. The policy section can only
//! add protected names; built-in deny-lists are never configurable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::ipc::protocol::DEFAULT_SOCKET_PATH;
use crate::terminate::TerminationSettings;

/// Config file name inside [`config_dir`].
pub const CONFIG_FILE: &str = "config.toml";

/// Default location of the helper's own config.
pub const DEFAULT_HELPER_CONFIG_PATH: &str = "/etc/forcequit/helper.toml";

/// Top-level caller configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Termination timings.
    pub termination: TerminationConfig,
    /// Helper channel settings.
    pub ipc: IpcConfig,
    /// Background validation settings.
    pub validation: ValidationConfig,
    /// Additions to the built-in policy tables.
    pub policy: PolicyConfig,
    /// Helper installation paths.
    pub helper: HelperInstallConfig,
}

/// Termination timings, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminationConfig {
    /// How long to wait after the graceful signal.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// How long to wait for exit after the forced signal.
    #[serde(default = "default_force_timeout_ms")]
    pub force_timeout_ms: u64,

    /// Liveness polling interval while waiting.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            force_timeout_ms: default_force_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TerminationConfig {
    /// Convert to orchestrator settings.
    pub fn settings(&self) -> TerminationSettings {
        TerminationSettings {
            grace_period: Duration::from_millis(self.grace_period_ms),
            force_timeout: Duration::from_millis(self.force_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

/// Helper channel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IpcConfig {
    /// Unix socket the helper listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Per-request timeout; expiry means the helper is unavailable.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum accepted frame body size.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            request_timeout_secs: default_request_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Background validation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Seconds between validation cycles.
    #[serde(default = "default_validation_interval_secs")]
    pub interval_secs: u64,

    /// Per-rule timeout; expiry counts as a rule failure.
    #[serde(default = "default_rule_timeout_ms")]
    pub rule_timeout_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_validation_interval_secs(),
            rule_timeout_ms: default_rule_timeout_ms(),
        }
    }
}

/// Additions to the built-in policy tables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Extra process names to treat as critical (never terminated).
    pub extra_protected_names: Vec<String>,

    /// Extra process names a sweep leaves running.
    pub preserved_names: Vec<String>,
}

/// Where the helper binary comes from and where it is installed.
#[derive(Debug, Clone, Deserialize)]
pub struct HelperInstallConfig {
    /// Helper binary to install. Defaults to `forcequit-helper` next to the
    /// running executable.
    #[serde(default)]
    pub source_binary: Option<PathBuf>,

    /// Install destination of the helper binary.
    #[serde(default = "default_helper_install_path")]
    pub install_path: PathBuf,

    /// Helper config file written at install time.
    #[serde(default = "default_helper_config_path")]
    pub config_path: PathBuf,
}

impl Default for HelperInstallConfig {
    fn default() -> Self {
        Self {
            source_binary: None,
            install_path: default_helper_install_path(),
            config_path: default_helper_config_path(),
        }
    }
}

// Default value functions for serde

fn default_grace_period_ms() -> u64 {
    2000
}
fn default_force_timeout_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_frame_bytes() -> usize {
    crate::ipc::frame::DEFAULT_MAX_FRAME_BYTES
}
fn default_validation_interval_secs() -> u64 {
    30
}
fn default_rule_timeout_ms() -> u64 {
    2000
}
fn default_helper_install_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Library/PrivilegedHelperTools/forcequit-helper")
    } else {
        PathBuf::from("/usr/local/libexec/forcequit-helper")
    }
}
fn default_helper_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_HELPER_CONFIG_PATH)
}

/// Load the caller config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load the config at `path`, or defaults if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(Config::default())
    }
}

/// Resolve the default config directory (`~/.forcequit/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".forcequit"))
}

/// Well-known files under the config directory.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root directory (`~/.forcequit`).
    pub root: PathBuf,
    /// `config.toml`.
    pub config_file: PathBuf,
    /// `state.json` (persisted hint).
    pub state_file: PathBuf,
    /// Audit JSON-lines file.
    pub audit_file: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Lay out runtime files under `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_file: root.join(CONFIG_FILE),
            state_file: root.join("state.json"),
            audit_file: root.join("audit").join("audit.jsonl"),
            logs_dir: root.join("logs"),
            root,
        }
    }

    /// Runtime files under [`config_dir`].
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn resolve() -> anyhow::Result<Self> {
        Ok(Self::under(config_dir()?))
    }
}
