//! Peer authentication from OS credentials.
//!
//! The peer's pid comes from the kernel (`SO_PEERCRED` / `LOCAL_PEERPID`),
//! never from the client. Its executable is resolved afresh and its code
//! identity compared against the allow-list.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use forcequit::policy::Capability;
use forcequit::process::signature::SignatureVerifier;
use forcequit::process::ProcessHost;

/// Kernel-reported credentials of a connected peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer pid, when the platform reports one.
    pub pid: Option<u32>,
    /// Peer uid.
    pub uid: Option<u32>,
}

impl PeerInfo {
    /// Read credentials from a connected Unix socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot report peer credentials.
    #[cfg(unix)]
    pub fn from_stream(stream: &tokio::net::UnixStream) -> std::io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
            uid: Some(cred.uid()),
        })
    }
}

/// An authenticated client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Code identifier that matched the allow-list.
    pub identifier: String,
    /// Peer pid.
    pub pid: u32,
    /// Peer uid, used when classifying targets on its behalf.
    pub uid: Option<u32>,
    /// Capabilities this client may exercise.
    pub capabilities: BTreeSet<Capability>,
}

impl ClientIdentity {
    /// Whether the client may exercise `cap`.
    pub fn allows(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Why a peer was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The platform did not report a peer pid.
    #[error("peer pid unavailable")]
    NoPeerPid,

    /// The peer exited or cannot be inspected.
    #[error("peer process {pid} could not be resolved")]
    Unresolvable {
        /// Peer pid.
        pid: u32,
    },

    /// The peer's code could not be identified or does not verify.
    #[error("peer process {pid} has no valid code identity: {reason}")]
    Unverified {
        /// Peer pid.
        pid: u32,
        /// Detail.
        reason: String,
    },

    /// Authentication did not run to completion.
    #[error("authentication interrupted: {reason}")]
    Interrupted {
        /// Detail.
        reason: String,
    },

    /// The identity is valid but not on the allow-list.
    #[error("client '{identifier}' is not allowed")]
    NotAllowed {
        /// Presented identifier.
        identifier: String,
    },
}

/// Decides whether a peer may use the helper.
pub trait ClientAuthenticator: Send + Sync {
    /// Authenticate `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the peer is refused.
    fn authenticate(&self, peer: &PeerInfo) -> Result<ClientIdentity, AuthError>;
}

/// Authenticates peers by the code identity of their executable.
pub struct SignatureAuthenticator {
    host: Arc<dyn ProcessHost>,
    verifier: Arc<dyn SignatureVerifier>,
    allowed: BTreeSet<String>,
    capabilities: BTreeSet<Capability>,
}

impl SignatureAuthenticator {
    /// Create an authenticator over an allow-list of code identifiers.
    pub fn new<I, C>(
        host: Arc<dyn ProcessHost>,
        verifier: Arc<dyn SignatureVerifier>,
        allowed: I,
        capabilities: C,
    ) -> Self
    where
        I: IntoIterator<Item = String>,
        C: IntoIterator<Item = Capability>,
    {
        Self {
            host,
            verifier,
            allowed: allowed.into_iter().collect(),
            capabilities: capabilities.into_iter().collect(),
        }
    }
}

impl ClientAuthenticator for SignatureAuthenticator {
    fn authenticate(&self, peer: &PeerInfo) -> Result<ClientIdentity, AuthError> {
        let pid = peer.pid.ok_or(AuthError::NoPeerPid)?;
        let descriptor = self
            .host
            .describe(pid)
            .ok_or(AuthError::Unresolvable { pid })?;
        let exe = descriptor.executable.ok_or_else(|| AuthError::Unverified {
            pid,
            reason: "no executable path".to_owned(),
        })?;

        let identity = self
            .verifier
            .identify(&exe)
            .map_err(|e| AuthError::Unverified {
                pid,
                reason: e.to_string(),
            })?;
        if !identity.valid {
            return Err(AuthError::Unverified {
                pid,
                reason: format!("signature of {} does not verify", exe.display()),
            });
        }
        if !self.allowed.contains(&identity.identifier) {
            return Err(AuthError::NotAllowed {
                identifier: identity.identifier,
            });
        }

        debug!(pid, identifier = %identity.identifier, "client authenticated");
        Ok(ClientIdentity {
            identifier: identity.identifier,
            pid,
            uid: peer.uid.or(descriptor.owner_uid),
            capabilities: self.capabilities.clone(),
        })
    }
}

impl std::fmt::Debug for SignatureAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureAuthenticator")
            .field("allowed", &self.allowed)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
