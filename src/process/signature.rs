//! Code-identity verification for executables.
//!
//! A [`SignatureVerifier`] answers two questions about an executable image:
//! does it verify, and what is its code identifier. The identifier is what
//! the helper compares against its allowed-client list, so it must be stable
//! for a given build and different for anything else.
//!
//! All external tool invocations use hardcoded program names and arguments.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Prefix used for digest-based code identifiers.
pub const DIGEST_ID_PREFIX: &str = "sha256:";

/// Identity of an executable image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIdentity {
    /// Stable identifier (bundle id on macOS, `sha256:<hex>` elsewhere).
    pub identifier: String,
    /// Whether the signature (or ownership/pin check) verified.
    pub valid: bool,
}

/// Errors produced while identifying an executable.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// The executable could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Executable path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The verification tool failed or produced no identifier.
    #[error("code identity unavailable for {path}: {reason}")]
    Unavailable {
        /// Executable path.
        path: PathBuf,
        /// Human-readable reason.
        reason: String,
    },
}

/// Verifies executables and extracts their code identifier.
pub trait SignatureVerifier: Send + Sync {
    /// Whether the executable at `path` verifies. Any error counts as `false`.
    fn verify(&self, path: &Path) -> bool;

    /// Extract the code identity of the executable at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError`] if the executable cannot be read or identified.
    fn identify(&self, path: &Path) -> Result<CodeIdentity, SignatureError>;
}

/// Return the verifier appropriate for the current platform.
pub fn platform_verifier() -> Arc<dyn SignatureVerifier> {
    if cfg!(target_os = "macos") {
        Arc::new(CodesignVerifier)
    } else {
        Arc::new(DigestVerifier::new())
    }
}

/// Return the helper's verifier for authenticating clients.
///
/// Where identifiers are digests, every `sha256:` entry in `allowed` is
/// pinned, so an allowed client verifies even when a user owns its binary.
pub fn client_verifier<S: AsRef<str>>(allowed: &[S]) -> Arc<dyn SignatureVerifier> {
    if cfg!(target_os = "macos") {
        Arc::new(CodesignVerifier)
    } else {
        Arc::new(DigestVerifier::new().with_pinned(pinned_digests(allowed)))
    }
}

/// Hex digests named by `sha256:` identifiers; other identifiers are skipped.
pub fn pinned_digests<S: AsRef<str>>(identifiers: &[S]) -> Vec<String> {
    identifiers
        .iter()
        .filter_map(|id| id.as_ref().strip_prefix(DIGEST_ID_PREFIX))
        .filter(|hex| !hex.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Compute the SHA-256 digest of a file as lowercase hex.
///
/// # Errors
///
/// Returns [`SignatureError::Io`] if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String, SignatureError> {
    let io_err = |source| SignatureError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Digest verifier (Linux and other Unix)
// ---------------------------------------------------------------------------

/// Ownership- and digest-based verifier for platforms without code signing.
///
/// An executable verifies when it is owned by root and not writable by group
/// or others (package-manager installed), or when its digest is pinned.
/// The identifier is always `sha256:<hex>` of the file contents.
#[derive(Debug, Clone, Default)]
pub struct DigestVerifier {
    pinned: HashSet<String>,
}

impl DigestVerifier {
    /// Create a verifier with no pinned digests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust executables with the given hex digests regardless of ownership.
    pub fn with_pinned<I, S>(mut self, digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pinned
            .extend(digests.into_iter().map(|d| d.into().to_ascii_lowercase()));
        self
    }

    fn pinned_match(&self, path: &Path) -> bool {
        !self.pinned.is_empty()
            && sha256_file(path).is_ok_and(|digest| self.pinned.contains(&digest))
    }
}

impl SignatureVerifier for DigestVerifier {
    fn verify(&self, path: &Path) -> bool {
        system_owned(path) || self.pinned_match(path)
    }

    fn identify(&self, path: &Path) -> Result<CodeIdentity, SignatureError> {
        let digest = sha256_file(path)?;
        let valid = system_owned(path) || self.pinned.contains(&digest);
        Ok(CodeIdentity {
            identifier: format!("{DIGEST_ID_PREFIX}{digest}"),
            valid,
        })
    }
}

/// Root-owned and not group/world-writable.
#[cfg(unix)]
pub fn system_owned(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.uid() == 0 && meta.mode() & 0o022 == 0,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cannot stat executable");
            false
        }
    }
}

/// Ownership is not meaningful here; never verifies by ownership alone.
#[cfg(not(unix))]
pub fn system_owned(_path: &Path) -> bool {
    false
}

// ---------------------------------------------------------------------------
// codesign verifier (macOS)
// ---------------------------------------------------------------------------

/// Verifier backed by the macOS `codesign` tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodesignVerifier;

impl SignatureVerifier for CodesignVerifier {
    fn verify(&self, path: &Path) -> bool {
        let status = std::process::Command::new("codesign")
            .args(["--verify", "--strict"])
            .arg(path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        match status {
            Ok(status) => status.success(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "failed to run codesign --verify");
                false
            }
        }
    }

    fn identify(&self, path: &Path) -> Result<CodeIdentity, SignatureError> {
        let output = std::process::Command::new("codesign")
            .args(["-d", "--verbose=2"])
            .arg(path)
            .output()
            .map_err(|source| SignatureError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        // codesign writes the display output to stderr.
        let text = String::from_utf8_lossy(&output.stderr);
        let identifier = parse_codesign_identifier(&text).ok_or_else(|| {
            SignatureError::Unavailable {
                path: path.to_path_buf(),
                reason: "no Identifier= line in codesign output".to_owned(),
            }
        })?;

        Ok(CodeIdentity {
            identifier,
            valid: output.status.success() && self.verify(path),
        })
    }
}

/// Extract the `Identifier=` value from `codesign -d` output.
pub fn parse_codesign_identifier(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Identifier="))
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
}

// ---------------------------------------------------------------------------
// Static verifier
// ---------------------------------------------------------------------------

/// Fixed-answer verifier for simulation and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    identities: HashMap<PathBuf, CodeIdentity>,
    default_valid: bool,
}

impl StaticVerifier {
    /// Verifier that answers `valid` for every unknown path.
    pub fn new(default_valid: bool) -> Self {
        Self {
            identities: HashMap::new(),
            default_valid,
        }
    }

    /// Register a fixed identity for `path`.
    pub fn with_identity(
        mut self,
        path: impl Into<PathBuf>,
        identifier: impl Into<String>,
        valid: bool,
    ) -> Self {
        self.identities.insert(
            path.into(),
            CodeIdentity {
                identifier: identifier.into(),
                valid,
            },
        );
        self
    }
}

impl SignatureVerifier for StaticVerifier {
    fn verify(&self, path: &Path) -> bool {
        self.identities
            .get(path)
            .map_or(self.default_valid, |identity| identity.valid)
    }

    fn identify(&self, path: &Path) -> Result<CodeIdentity, SignatureError> {
        self.identities
            .get(path)
            .cloned()
            .ok_or_else(|| SignatureError::Unavailable {
                path: path.to_path_buf(),
                reason: "unknown executable".to_owned(),
            })
    }
}
