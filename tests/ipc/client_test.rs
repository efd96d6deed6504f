//! Tests for `HelperClient` against a scripted in-process helper.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use forcequit::ipc::frame::DEFAULT_MAX_FRAME_BYTES;
use forcequit::ipc::protocol::{
    HelperHealth, HelperResponse, Progress, RejectKind, PROTOCOL_VERSION,
};
use forcequit::ipc::{
    read_frame, write_frame, ChannelError, ClientMessage, ClientSettings, HelperClient,
    HelperRequest, InProcessConnector, Operation, ServerMessage,
};

const MAX: usize = DEFAULT_MAX_FRAME_BYTES;

fn client(connector: InProcessConnector, timeout: Duration) -> HelperClient {
    HelperClient::new(
        Arc::new(connector),
        ClientSettings {
            request_timeout: timeout,
            max_frame_bytes: MAX,
        },
    )
}

async fn welcome(stream: &mut DuplexStream, version: u32) {
    write_frame(
        stream,
        &ServerMessage::Welcome {
            protocol_version: version,
            helper_version: "9.9.9".to_owned(),
        },
        MAX,
    )
    .await
    .expect("write welcome");
}

async fn accept(stream: &mut DuplexStream) {
    welcome(stream, PROTOCOL_VERSION).await;
    let hello: ClientMessage = read_frame(stream, MAX)
        .await
        .expect("read hello")
        .expect("hello frame");
    assert_eq!(
        hello,
        ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION
        }
    );
}

async fn next_request(stream: &mut DuplexStream) -> Option<HelperRequest> {
    match read_frame::<_, ClientMessage>(stream, MAX).await.expect("read request") {
        Some(ClientMessage::Request(request)) => Some(request),
        Some(other) => panic!("unexpected client message {other:?}"),
        None => None,
    }
}

/// Accept connections and answer every request with `answer`.
fn spawn_helper<F>(mut incoming: mpsc::UnboundedReceiver<DuplexStream>, answer: F)
where
    F: Fn(&HelperRequest) -> HelperResponse + Send + Sync + 'static,
{
    let answer = Arc::new(answer);
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.recv().await {
            let answer = Arc::clone(&answer);
            tokio::spawn(async move {
                accept(&mut stream).await;
                while let Some(request) = next_request(&mut stream).await {
                    let response = answer(&request);
                    write_frame(&mut stream, &ServerMessage::Response(response), MAX)
                        .await
                        .expect("write response");
                }
            });
        }
    });
}

#[tokio::test]
async fn handshake_then_requests_share_one_connection() {
    let (connector, incoming) = InProcessConnector::new();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let (count_tx, mut count_rx) = mpsc::unbounded_channel();

    // Count connections by wrapping the receiver.
    let (fwd_tx, fwd_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut incoming = incoming;
        while let Some(stream) = incoming.recv().await {
            let _ = count_tx.send(());
            let _ = fwd_tx.send(stream);
        }
    });
    spawn_helper(fwd_rx, move |req| {
        let _ = seen_tx.send(req.operation);
        HelperResponse::ok(req.id)
    });

    let client = client(connector, Duration::from_secs(5));
    assert!(!client.is_connected().await);
    client.ping().await.expect("first ping");
    client.ping().await.expect("second ping");

    assert!(client.is_connected().await);
    assert_eq!(client.helper_version().await.as_deref(), Some("9.9.9"));
    assert_eq!(seen_rx.recv().await, Some(Operation::Ping));
    assert_eq!(seen_rx.recv().await, Some(Operation::Ping));
    assert!(count_rx.recv().await.is_some());
    assert!(count_rx.try_recv().is_err(), "second ping must reuse the connection");
}

#[tokio::test]
async fn authentication_rejection_is_reported() {
    let (connector, mut incoming) = InProcessConnector::new();
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.recv().await {
            let rejected = ServerMessage::Rejected {
                kind: RejectKind::Authentication,
                reason: "client 'forged' is not allowed".to_owned(),
            };
            write_frame(&mut stream, &rejected, MAX)
                .await
                .expect("write rejection");
        }
    });

    let client = client(connector, Duration::from_secs(5));
    let err = client.ping().await.expect_err("rejected");
    assert!(matches!(err, ChannelError::AuthenticationFailed(ref reason) if reason.contains("forged")));
    assert!(!client.is_connected().await);
    assert!(!err.remediation().is_empty());
}

#[tokio::test]
async fn capacity_rejection_is_unavailable() {
    let (connector, mut incoming) = InProcessConnector::new();
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.recv().await {
            let rejected = ServerMessage::Rejected {
                kind: RejectKind::Capacity,
                reason: "full".to_owned(),
            };
            let _ = write_frame(&mut stream, &rejected, MAX).await;
        }
    });

    let client = client(connector, Duration::from_secs(5));
    let err = client.ping().await.expect_err("rejected");
    assert!(matches!(err, ChannelError::Unavailable(_)));
}

#[tokio::test]
async fn version_mismatch_is_a_protocol_error() {
    let (connector, mut incoming) = InProcessConnector::new();
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.recv().await {
            welcome(&mut stream, PROTOCOL_VERSION + 1).await;
        }
    });

    let client = client(connector, Duration::from_secs(5));
    let err = client.ping().await.expect_err("mismatch");
    assert!(matches!(err, ChannelError::Protocol(_)));
}

#[tokio::test]
async fn refusal_keeps_the_connection() {
    let (connector, incoming) = InProcessConnector::new();
    spawn_helper(incoming, |req| match req.operation {
        Operation::SystemRestart => HelperResponse::refused(req.id, "client is not allowed system_restart"),
        _ => HelperResponse::ok(req.id),
    });

    let client = client(connector, Duration::from_secs(5));
    let err = client.system_restart().await.expect_err("refused");
    assert!(matches!(err, ChannelError::Refused(ref reason) if reason.contains("not allowed")));
    assert!(client.is_connected().await);
    client.ping().await.expect("connection still usable");
}

#[tokio::test(start_paused = true)]
async fn timeout_drops_the_connection() {
    let (connector, mut incoming) = InProcessConnector::new();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(mut stream) = incoming.recv().await {
            accept(&mut stream).await;
            // Read the request and never answer.
            let _ = next_request(&mut stream).await;
            held.push(stream);
        }
    });

    let client = client(connector, Duration::from_secs(2));
    let err = client.ping().await.expect_err("times out");
    assert!(matches!(err, ChannelError::Timeout(d) if d == Duration::from_secs(2)));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn invalidate_forces_a_new_handshake() {
    let (connector, incoming) = InProcessConnector::new();
    let (count_tx, mut count_rx) = mpsc::unbounded_channel();
    let (fwd_tx, fwd_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut incoming = incoming;
        while let Some(stream) = incoming.recv().await {
            let _ = count_tx.send(());
            let _ = fwd_tx.send(stream);
        }
    });
    spawn_helper(fwd_rx, |req| HelperResponse::ok(req.id));

    let client = client(connector, Duration::from_secs(5));
    client.ping().await.expect("ping");
    client.invalidate().await;
    assert!(!client.is_connected().await);
    client.ping().await.expect("ping after invalidate");

    assert!(count_rx.recv().await.is_some());
    assert!(count_rx.recv().await.is_some());
}

#[tokio::test]
async fn health_progress_is_forwarded() {
    let (connector, mut incoming) = InProcessConnector::new();
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.recv().await {
            accept(&mut stream).await;
            while let Some(request) = next_request(&mut stream).await {
                for (stage, percent) in [("tables", 0u8), ("done", 100u8)] {
                    let progress = ServerMessage::Progress(Progress {
                        id: request.id,
                        stage: stage.to_owned(),
                        percent,
                    });
                    write_frame(&mut stream, &progress, MAX).await.expect("progress");
                }
                let response = HelperResponse {
                    health: Some(HelperHealth {
                        version: "9.9.9".to_owned(),
                        uptime_secs: 12,
                        active_connections: 1,
                        max_connections: 10,
                        checks: Vec::new(),
                    }),
                    ..HelperResponse::ok(request.id)
                };
                write_frame(&mut stream, &ServerMessage::Response(response), MAX)
                    .await
                    .expect("response");
            }
        }
    });

    let client = client(connector, Duration::from_secs(5));
    let (tx, mut rx) = mpsc::channel(8);
    let health = client.health_check(Some(tx)).await.expect("health");
    assert_eq!(health.max_connections, 10);

    let first = rx.recv().await.expect("first progress");
    let second = rx.recv().await.expect("second progress");
    assert_eq!((first.percent, second.percent), (0, 100));
}

#[tokio::test]
async fn unreachable_helper_is_unavailable() {
    let (connector, incoming) = InProcessConnector::new();
    drop(incoming);
    let client = client(connector, Duration::from_secs(5));
    let err = client.ping().await.expect_err("no helper");
    assert!(matches!(err, ChannelError::Unavailable(_)));
}
