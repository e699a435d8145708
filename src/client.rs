//! Client side of the broker connection.
//!
//! One persistent connection per wrapper (role `wrapper`) or tool invocation
//! (role `client`). Requests carry incrementing ids and are matched to
//! responses by id; unsolicited `inject` frames (id 0) are routed to their
//! own channel so a wrapper can service them while a request is in flight.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::paths;
use crate::protocol::{
    self, decode_payload, read_payload, write_message, ErrorReason, Message, Role, SessionInfo,
    SinkKind, Status, CONTROL_ID, PROTOCOL_VERSION,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket missing or nothing listening: the broker is not running.
    #[error("broker is not running")]
    NotRunning,
    #[error("{0}")]
    Environment(String),
    #[error("broker connection lost")]
    Disconnected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Structured error returned by the broker.
    #[error("broker error: {0}")]
    Broker(ErrorReason),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Frame(#[from] protocol::FrameError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn reason(&self) -> Option<ErrorReason> {
        match self {
            ClientError::Broker(reason) => Some(*reason),
            _ => None,
        }
    }
}

type Pending = Arc<parking_lot::Mutex<HashMap<u32, oneshot::Sender<Message>>>>;

#[derive(Debug)]
pub struct BrokerClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: Pending,
    next_id: AtomicU32,
    injects: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl BrokerClient {
    /// Connect to the user's broker socket and perform the handshake.
    pub async fn connect(role: Role) -> Result<Self, ClientError> {
        let path = paths::socket_path()
            .map_err(|e| ClientError::Environment(e.to_string()))?;
        Self::connect_to(&path, role).await
    }

    pub async fn connect_to(path: &Path, role: Role) -> Result<Self, ClientError> {
        let mut stream = UnixStream::connect(path).await.map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) {
                ClientError::NotRunning
            } else {
                ClientError::Io(e)
            }
        })?;

        // Handshake happens before the stream is split; the first frame from
        // the broker must be hello_ack.
        write_message(
            &mut stream,
            &Message::Hello {
                id: CONTROL_ID,
                version: PROTOCOL_VERSION,
                role,
            },
        )
        .await?;
        let payload = read_payload(&mut stream)
            .await?
            .ok_or(ClientError::Disconnected)?;
        match decode_payload(&payload)
            .map_err(|e| ClientError::Protocol(e.to_string()))?
        {
            Message::HelloAck {
                status: Status::Ok, ..
            } => {}
            Message::HelloAck {
                error: Some(reason),
                ..
            } => return Err(ClientError::Broker(reason)),
            Message::HelloAck { .. } => {
                return Err(ClientError::Handshake("broker rejected handshake".into()))
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected hello_ack, got {other:?}"
                )))
            }
        }

        let (mut read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();

        let pending_reader = Arc::clone(&pending);
        tokio::spawn(async move {
            loop {
                let payload = match read_payload(&mut read_half).await {
                    Ok(Some(payload)) => payload,
                    Ok(None) | Err(_) => break,
                };
                match decode_payload(&payload) {
                    Ok(Message::Inject { content, .. }) => {
                        if inject_tx.send(content).is_err() {
                            break;
                        }
                    }
                    Ok(msg @ (Message::Response { .. } | Message::HelloAck { .. })) => {
                        if let Some(tx) = pending_reader.lock().remove(&msg.id()) {
                            let _ = tx.send(msg);
                        }
                    }
                    Ok(other) => {
                        tracing::debug!(?other, "ignoring unexpected broker message");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable frame from broker");
                        break;
                    }
                }
            }
            // Wake every waiter with a disconnect.
            pending_reader.lock().clear();
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(write_half)),
            pending,
            next_id: AtomicU32::new(1),
            injects: Some(inject_rx),
        })
    }

    /// Take the unsolicited-inject receiver. Wrapper role only; meaningful
    /// once per connection.
    pub fn take_injects(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.injects.take()
    }

    fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != CONTROL_ID {
                return id;
            }
        }
    }

    /// Send one request and await its id-matched response. Responses on a
    /// single connection come back in request order, but matching by id keeps
    /// this correct even with pipelined callers.
    async fn request(&self, build: impl FnOnce(u32) -> Message) -> Result<ResponseFields, ClientError> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let msg = build(id);
        let write_result = {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, &msg).await
        };
        if let Err(e) = write_result {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }

        match rx.await.map_err(|_| ClientError::Disconnected)? {
            Message::Response {
                status: Status::Ok,
                size,
                turn_id,
                sessions,
                ..
            } => Ok(ResponseFields {
                size,
                turn_id,
                sessions,
            }),
            Message::Response {
                error: Some(reason),
                ..
            } => Err(ClientError::Broker(reason)),
            other => Err(ClientError::Protocol(format!(
                "unexpected response shape: {other:?}"
            ))),
        }
    }

    pub async fn register(&self, session: &str, pid: u32, pattern: &str) -> Result<(), ClientError> {
        self.request(|id| Message::Register {
            id,
            session: session.into(),
            pid,
            pattern: pattern.into(),
        })
        .await
        .map(|_| ())
    }

    pub async fn deregister(&self, session: &str) -> Result<(), ClientError> {
        self.request(|id| Message::Deregister {
            id,
            session: session.into(),
        })
        .await
        .map(|_| ())
    }

    /// Publish a completed turn; returns the broker-assigned turn id.
    pub async fn turn_completed(
        &self,
        session: &str,
        content: Vec<u8>,
        interrupted: bool,
        truncated: bool,
    ) -> Result<Option<u64>, ClientError> {
        self.request(|id| Message::TurnCompleted {
            id,
            session: session.into(),
            content,
            interrupted,
            truncated,
        })
        .await
        .map(|fields| fields.turn_id)
    }

    /// Copy a session's latest turn into the relay buffer. Returns the byte
    /// count and the captured turn's id.
    pub async fn capture(&self, session: &str) -> Result<(u64, Option<u64>), ClientError> {
        self.request(|id| Message::Capture {
            id,
            session: session.into(),
        })
        .await
        .map(|fields| (fields.size.unwrap_or(0), fields.turn_id))
    }

    pub async fn paste(&self, session: &str) -> Result<(), ClientError> {
        self.request(|id| Message::Paste {
            id,
            session: session.into(),
        })
        .await
        .map(|_| ())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        self.request(|id| Message::ListSessions { id })
            .await
            .map(|fields| fields.sessions.unwrap_or_default())
    }

    pub async fn deliver(
        &self,
        session: &str,
        sink: SinkKind,
        path: Option<String>,
    ) -> Result<(), ClientError> {
        self.request(|id| Message::Deliver {
            id,
            session: session.into(),
            sink,
            path,
        })
        .await
        .map(|_| ())
    }
}

struct ResponseFields {
    size: Option<u64>,
    turn_id: Option<u64>,
    sessions: Option<Vec<SessionInfo>>,
}
