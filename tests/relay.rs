//! End-to-end protocol tests: a real broker on a real socket, with scripted
//! wrapper and client connections standing in for PTY sessions and the
//! hotkey client.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use clippy::broker::Broker;
use clippy::client::{BrokerClient, ClientError};
use clippy::protocol::{
    decode_payload, read_payload, write_message, ErrorReason, Message, Role, Status, CONTROL_ID,
    PROTOCOL_VERSION,
};

struct TestBroker {
    socket: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestBroker {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");
        let broker = Broker::bind_at(&socket).await.unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            broker
                .serve_with_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            socket,
            shutdown: Some(shutdown_tx),
            handle,
            _dir: dir,
        }
    }

    async fn wrapper(&self, session: &str) -> (BrokerClient, mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut client = BrokerClient::connect_to(&self.socket, Role::Wrapper)
            .await
            .unwrap();
        let injects = client.take_injects().unwrap();
        client.register(session, 1000, "^> $").await.unwrap();
        (client, injects)
    }

    async fn client(&self) -> BrokerClient {
        BrokerClient::connect_to(&self.socket, Role::Client)
            .await
            .unwrap()
    }

    async fn stop(mut self) {
        let _ = self.shutdown.take().unwrap().send(());
        let _ = self.handle.await;
    }
}

async fn recv_inject(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for inject")
        .expect("inject channel closed")
}

#[tokio::test]
async fn scenario_a_basic_relay() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let (_w2, mut i2) = broker.wrapper("s2").await;
    let client = broker.client().await;

    // The child wrote "hello\n> "; the detector captured "hello\n".
    w1.turn_completed("s1", b"hello\n".to_vec(), false, false)
        .await
        .unwrap();

    let (size, turn_id) = client.capture("s1").await.unwrap();
    assert_eq!(size, 6);
    assert!(turn_id.is_some());

    client.paste("s2").await.unwrap();
    assert_eq!(recv_inject(&mut i2).await, b"hello\n");

    broker.stop().await;
}

#[tokio::test]
async fn scenario_b_capture_without_turn() {
    let broker = TestBroker::start().await;
    let (_w1, _i1) = broker.wrapper("s1").await;
    let client = broker.client().await;

    let err = client.capture("s1").await.unwrap_err();
    assert_eq!(err.reason(), Some(ErrorReason::NoTurn));

    broker.stop().await;
}

#[tokio::test]
async fn scenario_c_paste_with_empty_relay() {
    let broker = TestBroker::start().await;
    let (_w1, _i1) = broker.wrapper("s1").await;
    let client = broker.client().await;

    let err = client.paste("s1").await.unwrap_err();
    assert_eq!(err.reason(), Some(ErrorReason::BufferEmpty));

    broker.stop().await;
}

#[tokio::test]
async fn scenario_d_interrupted_turn_relays_partial_bytes() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let (_w2, mut i2) = broker.wrapper("s2").await;
    let client = broker.client().await;

    let partial = b"thinking about it\x1b[0m".to_vec();
    w1.turn_completed("s1", partial.clone(), true, false)
        .await
        .unwrap();

    let (size, _) = client.capture("s1").await.unwrap();
    assert_eq!(size as usize, partial.len());
    client.paste("s2").await.unwrap();
    assert_eq!(recv_inject(&mut i2).await, partial);

    broker.stop().await;
}

#[tokio::test]
async fn scenario_e_replacement_keeps_only_latest() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let (_w2, mut i2) = broker.wrapper("s2").await;
    let client = broker.client().await;

    let first = w1
        .turn_completed("s1", b"aaa\n".to_vec(), false, false)
        .await
        .unwrap()
        .unwrap();
    let second = w1
        .turn_completed("s1", b"bbb\n".to_vec(), false, false)
        .await
        .unwrap()
        .unwrap();
    assert!(second > first);

    let (size, turn_id) = client.capture("s1").await.unwrap();
    assert_eq!(size, 4);
    assert_eq!(turn_id, Some(second));
    client.paste("s2").await.unwrap();
    assert_eq!(recv_inject(&mut i2).await, b"bbb\n");

    broker.stop().await;
}

#[tokio::test]
async fn scenario_f_disconnect_during_paste() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let (w2, i2) = broker.wrapper("s2").await;
    let (_w3, mut i3) = broker.wrapper("s3").await;
    let client = broker.client().await;

    w1.turn_completed("s1", b"payload\n".to_vec(), false, false)
        .await
        .unwrap();
    client.capture("s1").await.unwrap();

    // S2's wrapper exits; its connection drops.
    drop(i2);
    drop(w2);
    // Give the broker a moment to observe the close.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = client.paste("s2").await.unwrap_err();
    assert!(
        matches!(
            err.reason(),
            Some(ErrorReason::SessionDisconnected) | Some(ErrorReason::SessionNotFound)
        ),
        "unexpected error: {err:?}"
    );

    // The relay buffer survives; a later paste succeeds.
    client.paste("s3").await.unwrap();
    assert_eq!(recv_inject(&mut i3).await, b"payload\n");

    broker.stop().await;
}

#[tokio::test]
async fn relay_buffer_persists_across_pastes() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let (_w2, mut i2) = broker.wrapper("s2").await;
    let client = broker.client().await;

    w1.turn_completed("s1", b"same\n".to_vec(), false, false)
        .await
        .unwrap();
    client.capture("s1").await.unwrap();

    client.paste("s2").await.unwrap();
    client.paste("s2").await.unwrap();
    assert_eq!(recv_inject(&mut i2).await, b"same\n");
    assert_eq!(recv_inject(&mut i2).await, b"same\n");

    broker.stop().await;
}

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    let broker = TestBroker::start().await;
    let (_w1, _i1) = broker.wrapper("dup").await;

    let other = BrokerClient::connect_to(&broker.socket, Role::Wrapper)
        .await
        .unwrap();
    let err = other.register("dup", 2000, "^> $").await.unwrap_err();
    assert_eq!(err.reason(), Some(ErrorReason::DuplicateSession));
    // The connection stays usable after a request-level error.
    assert_eq!(other.list_sessions().await.unwrap().len(), 1);

    broker.stop().await;
}

#[tokio::test]
async fn byte_exact_relay_of_binary_content() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let (_w2, mut i2) = broker.wrapper("s2").await;
    let client = broker.client().await;

    let mut content: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    content.extend_from_slice(b"\x1b[31m\xff\xfe\x00");
    w1.turn_completed("s1", content.clone(), false, false)
        .await
        .unwrap();
    client.capture("s1").await.unwrap();
    client.paste("s2").await.unwrap();
    assert_eq!(recv_inject(&mut i2).await, content);

    broker.stop().await;
}

#[tokio::test]
async fn deregister_then_capture_is_not_found() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let client = broker.client().await;

    w1.turn_completed("s1", b"gone\n".to_vec(), false, false)
        .await
        .unwrap();
    w1.deregister("s1").await.unwrap();
    // Deregister is idempotent.
    w1.deregister("s1").await.unwrap();

    let err = client.capture("s1").await.unwrap_err();
    assert_eq!(err.reason(), Some(ErrorReason::SessionNotFound));

    broker.stop().await;
}

#[tokio::test]
async fn list_sessions_reflects_state() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("a").await;
    let (_w2, _i2) = broker.wrapper("b").await;
    let client = broker.client().await;

    w1.turn_completed("a", b"t\n".to_vec(), false, false)
        .await
        .unwrap();

    let sessions = client.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);
    let a = sessions.iter().find(|s| s.session == "a").unwrap();
    let b = sessions.iter().find(|s| s.session == "b").unwrap();
    assert!(a.has_turn);
    assert!(!b.has_turn);

    broker.stop().await;
}

#[tokio::test]
async fn unknown_request_type_gets_structured_error() {
    use serde::Serialize;
    use tokio::net::UnixStream;

    let broker = TestBroker::start().await;
    let mut stream = UnixStream::connect(&broker.socket).await.unwrap();

    write_message(
        &mut stream,
        &Message::Hello {
            id: CONTROL_ID,
            version: PROTOCOL_VERSION,
            role: Role::Client,
        },
    )
    .await
    .unwrap();
    let ack = read_payload(&mut stream).await.unwrap().unwrap();
    assert!(matches!(
        decode_payload(&ack).unwrap(),
        Message::HelloAck {
            status: Status::Ok,
            ..
        }
    ));

    #[derive(Serialize)]
    struct FutureRequest {
        #[serde(rename = "type")]
        msg_type: &'static str,
        id: u32,
    }
    let payload = rmp_serde::to_vec_named(&FutureRequest {
        msg_type: "capture_by_id",
        id: 41,
    })
    .unwrap();
    let mut frame = Vec::new();
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    use tokio::io::AsyncWriteExt;
    stream.write_all(&frame).await.unwrap();

    let response = read_payload(&mut stream).await.unwrap().unwrap();
    match decode_payload(&response).unwrap() {
        Message::Response {
            id,
            status: Status::Error,
            error,
            ..
        } => {
            assert_eq!(id, 41);
            assert_eq!(error, Some(ErrorReason::UnknownType));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // The connection survives an unknown type.
    write_message(&mut stream, &Message::ListSessions { id: 42 })
        .await
        .unwrap();
    let response = read_payload(&mut stream).await.unwrap().unwrap();
    assert!(matches!(
        decode_payload(&response).unwrap(),
        Message::Response {
            id: 42,
            status: Status::Ok,
            ..
        }
    ));

    broker.stop().await;
}

#[tokio::test]
async fn version_mismatch_closes_connection() {
    use tokio::net::UnixStream;

    let broker = TestBroker::start().await;
    let mut stream = UnixStream::connect(&broker.socket).await.unwrap();

    write_message(
        &mut stream,
        &Message::Hello {
            id: CONTROL_ID,
            version: PROTOCOL_VERSION + 1,
            role: Role::Client,
        },
    )
    .await
    .unwrap();

    let ack = read_payload(&mut stream).await.unwrap().unwrap();
    match decode_payload(&ack).unwrap() {
        Message::HelloAck { status, error, .. } => {
            assert_eq!(status, Status::Error);
            assert_eq!(error, Some(ErrorReason::VersionMismatch));
        }
        other => panic!("unexpected ack: {other:?}"),
    }
    // Broker closes after the rejection.
    assert!(read_payload(&mut stream).await.unwrap().is_none());

    broker.stop().await;
}

#[tokio::test]
async fn file_sink_delivery_from_broker() {
    let broker = TestBroker::start().await;
    let (w1, _i1) = broker.wrapper("s1").await;
    let client = broker.client().await;

    let content = b"turn for the file sink\n".to_vec();
    w1.turn_completed("s1", content.clone(), false, false)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("turn.txt");
    client
        .deliver(
            "s1",
            clippy::protocol::SinkKind::File,
            Some(out.to_string_lossy().into_owned()),
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content);

    broker.stop().await;
}

#[tokio::test]
async fn stale_socket_is_replaced_and_live_socket_refused() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("broker.sock");

    // A dead broker left its socket behind.
    {
        let stale = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        drop(stale);
    }
    assert!(socket.exists());
    let broker = Broker::bind_at(&socket).await.unwrap();

    // A second broker must refuse to displace the live one.
    let err = Broker::bind_at(&socket).await.unwrap_err();
    assert!(err.to_string().contains("already listening"));
    drop(broker);
}

#[tokio::test]
async fn wrapper_client_errors_when_broker_absent() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("broker.sock");
    let err = BrokerClient::connect_to(&socket, Role::Wrapper)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotRunning));
}
