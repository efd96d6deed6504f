//! Configuration loading for the helper daemon.
//!
//! Loads `/etc/forcequit/helper.toml`. All sections use `#[serde(default)]`
//! so the seed written by the installer (socket path and allowed clients
//! only) is a complete config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use forcequit::config::{PolicyConfig, TerminationConfig};
use forcequit::ipc::frame::DEFAULT_MAX_FRAME_BYTES;
use forcequit::ipc::protocol::DEFAULT_SOCKET_PATH;
use forcequit::policy::Capability;

/// Top-level helper configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Who may connect and what they may do.
    pub clients: ClientsConfig,
    /// Termination timings.
    pub termination: TerminationConfig,
    /// Additions to the built-in policy tables.
    pub policy: PolicyConfig,
    /// Log and audit locations.
    pub paths: PathsConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unix socket to listen on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Concurrent connection cap; excess connections are rejected.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds a connection may sit idle before it is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum accepted frame body size.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServerConfig {
    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Client allow-list.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientsConfig {
    /// Code identifiers allowed to connect. Empty means nobody.
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Capabilities allowed clients may exercise through the helper.
    #[serde(default = "default_client_capabilities")]
    pub capabilities: Vec<Capability>,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            capabilities: default_client_capabilities(),
        }
    }
}

/// Log and audit locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory for rotated JSON logs.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Audit JSON-lines file.
    #[serde(default = "default_audit_file")]
    pub audit_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
            audit_file: default_audit_file(),
        }
    }
}

// Default value functions for serde

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}
fn default_max_connections() -> usize {
    10
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_client_capabilities() -> Vec<Capability> {
    Capability::ALL
        .into_iter()
        .filter(|cap| forcequit::policy::capability::resolve(*cap).requires_helper)
        .collect()
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("/var/log/forcequit")
}
fn default_audit_file() -> PathBuf {
    PathBuf::from("/var/log/forcequit/helper-audit.jsonl")
}

/// Load the helper config from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the config
/// is unusable.
pub fn load_helper_config(path: &Path) -> anyhow::Result<HelperConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: HelperConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Reject configs the server cannot run with.
///
/// # Errors
///
/// Returns an error describing the first problem found.
pub fn validate(config: &HelperConfig) -> anyhow::Result<()> {
    if config.server.max_connections == 0 {
        anyhow::bail!("server.max_connections must be at least 1");
    }
    if config.server.idle_timeout_secs == 0 {
        anyhow::bail!("server.idle_timeout_secs must be at least 1");
    }
    if let Some(cap) = config
        .clients
        .capabilities
        .iter()
        .find(|cap| !forcequit::policy::capability::resolve(**cap).requires_helper)
    {
        anyhow::bail!("clients.capabilities: {cap} is not served by the helper");
    }
    Ok(())
}
