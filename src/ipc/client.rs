//! Caller side of the helper channel.
//!
//! [`HelperClient`] keeps at most one connection, opened lazily on the
//! first request. A timeout or transport error drops the connection; the
//! next request reconnects. Failed requests are never retried here, so an
//! authentication failure surfaces once and is not replayed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::frame::{read_frame, write_frame, FrameError, DEFAULT_MAX_FRAME_BYTES};
use super::protocol::{
    ClientMessage, HelperHealth, HelperRequest, HelperResponse, Operation, Progress, RejectKind,
    RequestParameters, ServerMessage, PROTOCOL_VERSION,
};
use crate::process::ProcessDescriptor;
use crate::terminate::{TerminationMode, TerminationOutcome};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the helper channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The helper cannot be reached or closed the connection.
    #[error("helper unavailable: {0}")]
    Unavailable(String),

    /// No response within the request timeout.
    #[error("helper did not answer within {0:?}")]
    Timeout(Duration),

    /// The helper rejected our code identity.
    #[error("helper rejected this client: {0}")]
    AuthenticationFailed(String),

    /// Malformed or unexpected traffic.
    #[error("helper protocol error: {0}")]
    Protocol(String),

    /// The helper answered but refused the request.
    #[error("helper refused the request: {0}")]
    Refused(String),
}

impl ChannelError {
    /// What the user can do about it.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => {
                "check that the helper service is installed and running"
            }
            Self::AuthenticationFailed(_) => {
                "reinstall the helper so its client allow-list matches this build"
            }
            Self::Protocol(_) => "update the helper to match this version",
            Self::Refused(_) => "the helper does not permit this operation",
        }
    }
}

impl From<FrameError> for ChannelError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => Self::Unavailable(io.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Any bidirectional byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Opens transport connections to the helper.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new stream.
    async fn connect(&self) -> std::io::Result<Box<dyn ByteStream>>;
}

/// Connects to the helper's Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    path: PathBuf,
}

impl UnixSocketConnector {
    /// Connector for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Connector for UnixSocketConnector {
    #[cfg(unix)]
    async fn connect(&self) -> std::io::Result<Box<dyn ByteStream>> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    async fn connect(&self) -> std::io::Result<Box<dyn ByteStream>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("unix sockets unavailable; cannot reach {}", self.path.display()),
        ))
    }
}

/// Hands the server half of an in-memory duplex pipe to a receiver for
/// every connection. Used to run a helper server in the same process.
#[derive(Debug, Clone)]
pub struct InProcessConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    buffer: usize,
}

impl InProcessConnector {
    /// Create the connector and the receiver of server-side streams.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                buffer: DEFAULT_MAX_FRAME_BYTES,
            },
            rx,
        )
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self) -> std::io::Result<Box<dyn ByteStream>> {
        let (client, server) = tokio::io::duplex(self.buffer);
        self.tx.send(server).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "in-process server gone")
        })?;
        Ok(Box::new(client))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client tuning.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Per-request deadline, including connecting and the handshake.
    pub request_timeout: Duration,
    /// Frame size limit.
    pub max_frame_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct Connection {
    stream: Box<dyn ByteStream>,
    helper_version: String,
}

/// Authenticated request/response client for the helper.
pub struct HelperClient {
    connector: Arc<dyn Connector>,
    settings: ClientSettings,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl HelperClient {
    /// Create a client. No connection is made until the first request.
    pub fn new(connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        Self {
            connector,
            settings,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Drop the current connection, if any.
    pub async fn invalidate(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!("helper connection invalidated");
        }
    }

    /// Whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Version reported by the connected helper.
    pub async fn helper_version(&self) -> Option<String> {
        self.conn
            .lock()
            .await
            .as_ref()
            .map(|c| c.helper_version.clone())
    }

    /// Liveness check.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the helper cannot be reached or refuses.
    pub async fn ping(&self) -> Result<(), ChannelError> {
        self.exchange(Operation::Ping, None, RequestParameters::default(), None)
            .await
            .map(|_| ())
    }

    /// Ask the helper to terminate `pid`. The helper classifies the target
    /// itself and applies the same tier rules.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or refusal.
    pub async fn terminate(
        &self,
        pid: u32,
        mode: TerminationMode,
    ) -> Result<TerminationOutcome, ChannelError> {
        self.send_terminate(
            pid,
            RequestParameters {
                mode: Some(mode),
                launch_time: None,
            },
        )
        .await
    }

    /// Like [`terminate`](Self::terminate), pinned to the instance in
    /// `target`: the helper blocks the request if the pid was recycled.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or refusal.
    pub async fn terminate_instance(
        &self,
        target: &ProcessDescriptor,
        mode: TerminationMode,
    ) -> Result<TerminationOutcome, ChannelError> {
        self.send_terminate(
            target.pid,
            RequestParameters {
                mode: Some(mode),
                launch_time: Some(target.launch_time),
            },
        )
        .await
    }

    async fn send_terminate(
        &self,
        pid: u32,
        parameters: RequestParameters,
    ) -> Result<TerminationOutcome, ChannelError> {
        let response = self
            .exchange(Operation::Terminate, Some(pid), parameters, None)
            .await?;
        response
            .outcome
            .ok_or_else(|| ChannelError::Protocol("terminate response without outcome".into()))
    }

    /// Fetch the helper's health report. Progress frames are forwarded to
    /// `progress` when given.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or refusal.
    pub async fn health_check(
        &self,
        progress: Option<mpsc::Sender<Progress>>,
    ) -> Result<HelperHealth, ChannelError> {
        let response = self
            .exchange(
                Operation::HealthCheck,
                None,
                RequestParameters::default(),
                progress.as_ref(),
            )
            .await?;
        response
            .health
            .ok_or_else(|| ChannelError::Protocol("health response without report".into()))
    }

    /// Ask the helper to restart the machine.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or refusal.
    pub async fn system_restart(&self) -> Result<(), ChannelError> {
        self.exchange(Operation::SystemRestart, None, RequestParameters::default(), None)
            .await
            .map(|_| ())
    }

    async fn exchange(
        &self,
        operation: Operation,
        target_pid: Option<u32>,
        parameters: RequestParameters,
        progress: Option<&mpsc::Sender<Progress>>,
    ) -> Result<HelperResponse, ChannelError> {
        let mut slot = self.conn.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = ClientMessage::Request(HelperRequest {
            id,
            operation,
            target_pid,
            parameters,
        });

        let result = tokio::time::timeout(
            self.settings.request_timeout,
            self.round_trip(&mut slot, &request, id, progress),
        )
        .await;
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(?operation, error = %e, "helper request failed");
                return Err(e);
            }
            Err(_) => {
                warn!(?operation, "helper request timed out; connection dropped");
                return Err(ChannelError::Timeout(self.settings.request_timeout));
            }
        };

        if response.success {
            Ok(response)
        } else {
            Err(ChannelError::Refused(
                response.error.unwrap_or_else(|| "no reason given".into()),
            ))
        }
    }

    /// The connection is taken out of `slot` for the duration of the request
    /// and only put back once the response arrives.
    async fn round_trip(
        &self,
        slot: &mut Option<Connection>,
        request: &ClientMessage,
        id: u64,
        progress: Option<&mpsc::Sender<Progress>>,
    ) -> Result<HelperResponse, ChannelError> {
        let max = self.settings.max_frame_bytes;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.handshake().await?,
        };
        write_frame(&mut conn.stream, request, max).await?;
        loop {
            match read_frame::<_, ServerMessage>(&mut conn.stream, max).await? {
                None => {
                    return Err(ChannelError::Unavailable(
                        "helper closed the connection".into(),
                    ))
                }
                Some(ServerMessage::Progress(p)) if p.id == id => {
                    if let Some(tx) = progress {
                        let _ = tx.send(p).await;
                    }
                }
                Some(ServerMessage::Response(response)) if response.id == id => {
                    *slot = Some(conn);
                    return Ok(response);
                }
                Some(ServerMessage::Rejected { kind, reason }) => {
                    return Err(rejection(kind, reason));
                }
                Some(other) => {
                    return Err(ChannelError::Protocol(format!(
                        "unexpected message for request {id}: {other:?}"
                    )));
                }
            }
        }
    }

    async fn handshake(&self) -> Result<Connection, ChannelError> {
        let max = self.settings.max_frame_bytes;
        let mut stream = self
            .connector
            .connect()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let helper_version = match read_frame::<_, ServerMessage>(&mut stream, max).await? {
            Some(ServerMessage::Welcome {
                protocol_version,
                helper_version,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ChannelError::Protocol(format!(
                        "helper speaks protocol {protocol_version}, client speaks {PROTOCOL_VERSION}"
                    )));
                }
                helper_version
            }
            Some(ServerMessage::Rejected { kind, reason }) => return Err(rejection(kind, reason)),
            Some(other) => {
                return Err(ChannelError::Protocol(format!(
                    "expected welcome, got {other:?}"
                )))
            }
            None => {
                return Err(ChannelError::Unavailable(
                    "helper closed the connection during handshake".into(),
                ))
            }
        };

        write_frame(
            &mut stream,
            &ClientMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
            },
            max,
        )
        .await?;
        debug!(%helper_version, "helper connection established");
        Ok(Connection {
            stream,
            helper_version,
        })
    }
}

impl std::fmt::Debug for HelperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn rejection(kind: RejectKind, reason: String) -> ChannelError {
    match kind {
        RejectKind::Authentication => ChannelError::AuthenticationFailed(reason),
        RejectKind::Capacity => ChannelError::Unavailable(format!("helper at capacity: {reason}")),
        RejectKind::Version => ChannelError::Protocol(reason),
    }
}
