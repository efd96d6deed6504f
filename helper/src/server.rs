//! Connection handling for the helper socket.
//!
//! Each accepted connection runs in its own task:
//!
//! 1. Take a connection slot; none free means `Rejected{capacity}`.
//! 2. Authenticate the peer from its kernel credentials; failure means
//!    `Rejected{authentication}`, audited.
//! 3. Send `Welcome`, expect `Hello` with a matching version.
//! 4. Serve requests one at a time until EOF, an error or the idle timeout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use forcequit::audit::{AuditEvent, AuditKind, AuditLog, Decision};
use forcequit::ipc::frame::{read_frame, write_frame, FrameError};
use forcequit::ipc::protocol::{
    ClientMessage, HelperRequest, RejectKind, ServerMessage, PROTOCOL_VERSION,
};

use crate::auth::{AuthError, ClientAuthenticator, ClientIdentity, PeerInfo};
use crate::handler::{ConnectionStats, RequestHandler};

/// Actor used in audit events from the server.
const ACTOR: &str = "helper";

/// Listener tuning.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Concurrent connection cap.
    pub max_connections: usize,
    /// Idle timeout per connection.
    pub idle_timeout: Duration,
    /// Frame size limit.
    pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            max_frame_bytes: forcequit::ipc::frame::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// The helper's IPC server.
pub struct HelperServer {
    settings: ServerSettings,
    authenticator: Arc<dyn ClientAuthenticator>,
    handler: Arc<RequestHandler>,
    audit: Arc<AuditLog>,
    slots: Arc<Semaphore>,
}

impl HelperServer {
    /// Create a server.
    pub fn new(
        settings: ServerSettings,
        authenticator: Arc<dyn ClientAuthenticator>,
        handler: Arc<RequestHandler>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
            authenticator,
            handler,
            audit,
        }
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.settings
            .max_connections
            .saturating_sub(self.slots.available_permits())
    }

    /// Accept one connection and serve it in a new task. Connections beyond
    /// the cap are rejected immediately, never queued.
    pub fn admit<S>(self: &Arc<Self>, stream: S, peer: PeerInfo) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = Arc::clone(self);
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => tokio::spawn(async move { server.serve(stream, peer, permit).await }),
            Err(_) => tokio::spawn(async move {
                warn!(peer_pid = ?peer.pid, "connection cap reached, rejecting");
                let mut stream = stream;
                let rejected = ServerMessage::Rejected {
                    kind: RejectKind::Capacity,
                    reason: format!(
                        "helper serves at most {} connections",
                        server.settings.max_connections
                    ),
                };
                let _ = write_frame(&mut stream, &rejected, server.settings.max_frame_bytes).await;
            }),
        }
    }

    async fn serve<S>(&self, mut stream: S, peer: PeerInfo, _permit: OwnedSemaphorePermit)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let max = self.settings.max_frame_bytes;

        let client = match self.authenticate(peer).await {
            Ok(client) => client,
            Err(e) => {
                warn!(peer_pid = ?peer.pid, error = %e, "client rejected");
                self.audit.record(AuditEvent::new(
                    ACTOR,
                    Decision::Denied,
                    e.to_string(),
                    AuditKind::ChannelRejected { peer_pid: peer.pid },
                ));
                let rejected = ServerMessage::Rejected {
                    kind: RejectKind::Authentication,
                    reason: e.to_string(),
                };
                let _ = write_frame(&mut stream, &rejected, max).await;
                return;
            }
        };

        let welcome = ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            helper_version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        if let Err(e) = write_frame(&mut stream, &welcome, max).await {
            debug!(error = %e, "client went away before welcome");
            return;
        }

        match self.next_message(&mut stream).await {
            Some(ClientMessage::Hello { protocol_version }) if protocol_version == PROTOCOL_VERSION => {}
            Some(ClientMessage::Hello { protocol_version }) => {
                let rejected = ServerMessage::Rejected {
                    kind: RejectKind::Version,
                    reason: format!(
                        "client speaks protocol {protocol_version}, helper speaks {PROTOCOL_VERSION}"
                    ),
                };
                let _ = write_frame(&mut stream, &rejected, max).await;
                return;
            }
            Some(ClientMessage::Request(_)) => {
                warn!(client = %client.identifier, "request before hello, closing");
                return;
            }
            None => return,
        }
        info!(client = %client.identifier, pid = client.pid, "client connected");

        while let Some(message) = self.next_message(&mut stream).await {
            let ClientMessage::Request(request) = message else {
                warn!(client = %client.identifier, "unexpected hello, closing");
                break;
            };
            if let Err(e) = self.respond(&mut stream, &client, request).await {
                debug!(client = %client.identifier, error = %e, "failed to answer request");
                break;
            }
        }
        debug!(client = %client.identifier, "connection closed");
    }

    /// Authenticate on the blocking pool; identification hashes the peer's
    /// executable or runs `codesign`.
    async fn authenticate(&self, peer: PeerInfo) -> Result<ClientIdentity, AuthError> {
        let authenticator = Arc::clone(&self.authenticator);
        tokio::task::spawn_blocking(move || authenticator.authenticate(&peer))
            .await
            .unwrap_or_else(|e| {
                Err(AuthError::Interrupted {
                    reason: e.to_string(),
                })
            })
    }

    /// Read the next message, or `None` on EOF, error or idle timeout.
    async fn next_message<S>(&self, stream: &mut S) -> Option<ClientMessage>
    where
        S: AsyncRead + Unpin,
    {
        match tokio::time::timeout(
            self.settings.idle_timeout,
            read_frame::<_, ClientMessage>(&mut *stream, self.settings.max_frame_bytes),
        )
        .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                debug!(error = %e, "bad frame from client");
                None
            }
            Err(_) => {
                debug!("idle timeout");
                None
            }
        }
    }

    async fn respond<S>(
        &self,
        stream: &mut S,
        client: &ClientIdentity,
        request: HelperRequest,
    ) -> Result<(), FrameError>
    where
        S: AsyncWrite + Unpin,
    {
        let max = self.settings.max_frame_bytes;
        let stats = ConnectionStats {
            active: self.active_connections(),
            max: self.settings.max_connections,
        };
        let (progress_tx, mut progress_rx) = mpsc::channel(8);
        let handling = self.handler.handle(client, request, stats, progress_tx);
        tokio::pin!(handling);

        let response = loop {
            tokio::select! {
                response = &mut handling => break response,
                Some(progress) = progress_rx.recv() => {
                    write_frame(&mut *stream, &ServerMessage::Progress(progress), max).await?;
                }
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            write_frame(&mut *stream, &ServerMessage::Progress(progress), max).await?;
        }
        write_frame(&mut *stream, &ServerMessage::Response(response), max).await
    }

    /// Accept connections from `listener` until shutdown.
    #[cfg(unix)]
    pub async fn run(self: Arc<Self>, listener: tokio::net::UnixListener, mut shutdown_rx: watch::Receiver<bool>) {
        info!(max_connections = self.settings.max_connections, "helper listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let peer = PeerInfo::from_stream(&stream).unwrap_or_else(|e| {
                            warn!(error = %e, "peer credentials unavailable");
                            PeerInfo::default()
                        });
                        self.admit(stream, peer);
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("helper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for HelperServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperServer")
            .field("settings", &self.settings)
            .field("active", &self.active_connections())
            .finish_non_exhaustive()
    }
}

/// Bind the helper socket, replacing a stale one. The socket is
/// world-connectable; access control happens per connection.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or its mode set.
#[cfg(unix)]
pub fn bind(path: &Path) -> anyhow::Result<tokio::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    use anyhow::Context;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("failed to set mode on {}", path.display()))?;
    Ok(listener)
}
