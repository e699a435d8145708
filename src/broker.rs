//! The broker daemon: all shared state and the socket that serves it.
//!
//! One broker per user, listening on `$XDG_RUNTIME_DIR/clippy/broker.sock`.
//! It owns the session table, each session's latest-turn buffer, and the
//! single global relay buffer. Every request's effect on that state happens
//! under one mutex, which is never held across an await; outbound frames
//! (responses and injects alike) go through per-connection writer tasks, so
//! `paste` can enqueue an inject and answer the client in the same critical
//! section.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::paths;
use crate::protocol::{
    decode_payload, read_payload, write_message, DecodeError, ErrorReason, FrameError, Message,
    Role, SessionInfo, Status, CONTROL_ID, PROTOCOL_VERSION,
};
use crate::sink;

#[derive(Debug, Clone)]
struct StoredTurn {
    turn_id: u64,
    content: Vec<u8>,
    #[allow(dead_code)]
    interrupted: bool,
    #[allow(dead_code)]
    truncated: bool,
}

#[derive(Debug)]
struct SessionEntry {
    pid: u32,
    /// Informational; the wrapper owns the pattern.
    #[allow(dead_code)]
    pattern: String,
    /// Set when the registering connection declared the wrapper role.
    #[allow(dead_code)]
    wrapper: bool,
    conn_id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    latest: Option<StoredTurn>,
}

#[derive(Debug, Clone)]
struct RelaySlot {
    content: Vec<u8>,
    turn_id: u64,
    /// Which session the bytes were captured from.
    #[allow(dead_code)]
    source: String,
}

#[derive(Default, Debug)]
struct BrokerState {
    sessions: HashMap<String, SessionEntry>,
    relay: Option<RelaySlot>,
    next_turn_id: u64,
}

impl BrokerState {
    fn register(
        &mut self,
        conn_id: u64,
        wrapper: bool,
        outbound: mpsc::UnboundedSender<Message>,
        session: String,
        pid: u32,
        pattern: String,
    ) -> Result<(), ErrorReason> {
        if self.sessions.contains_key(&session) {
            return Err(ErrorReason::DuplicateSession);
        }
        self.sessions.insert(
            session,
            SessionEntry {
                pid,
                pattern,
                wrapper,
                conn_id,
                outbound,
                latest: None,
            },
        );
        Ok(())
    }

    /// Idempotent: deregistering an absent session succeeds. The entry's
    /// latest turn dies with it.
    fn deregister(&mut self, session: &str) {
        self.sessions.remove(session);
    }

    fn turn_completed(
        &mut self,
        session: &str,
        content: Vec<u8>,
        interrupted: bool,
        truncated: bool,
    ) -> Result<u64, ErrorReason> {
        let entry = self
            .sessions
            .get_mut(session)
            .ok_or(ErrorReason::SessionNotFound)?;
        self.next_turn_id += 1;
        let turn_id = self.next_turn_id;
        entry.latest = Some(StoredTurn {
            turn_id,
            content,
            interrupted,
            truncated,
        });
        Ok(turn_id)
    }

    /// Copy (never move) the source's latest turn into the relay buffer.
    fn capture(&mut self, session: &str) -> Result<(u64, u64), ErrorReason> {
        let entry = self
            .sessions
            .get(session)
            .ok_or(ErrorReason::SessionNotFound)?;
        let turn = entry.latest.as_ref().ok_or(ErrorReason::NoTurn)?;
        let size = turn.content.len() as u64;
        let turn_id = turn.turn_id;
        self.relay = Some(RelaySlot {
            content: turn.content.clone(),
            turn_id,
            source: session.to_string(),
        });
        Ok((size, turn_id))
    }

    /// Enqueue an inject of the relay buffer toward the target's wrapper.
    /// The buffer is not cleared; the same content pastes repeatedly.
    fn paste(&mut self, session: &str) -> Result<(), ErrorReason> {
        let entry = self
            .sessions
            .get(session)
            .ok_or(ErrorReason::SessionNotFound)?;
        let slot = self.relay.as_ref().ok_or(ErrorReason::BufferEmpty)?;
        entry
            .outbound
            .send(Message::Inject {
                id: CONTROL_ID,
                content: slot.content.clone(),
            })
            .map_err(|_| ErrorReason::SessionDisconnected)
    }

    fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|(session, entry)| SessionInfo {
                session: session.clone(),
                pid: entry.pid,
                has_turn: entry.latest.is_some(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session.cmp(&b.session));
        sessions
    }

    /// Latest-turn bytes for sink delivery; the relay buffer is untouched.
    fn latest_turn(&self, session: &str) -> Result<Vec<u8>, ErrorReason> {
        let entry = self
            .sessions
            .get(session)
            .ok_or(ErrorReason::SessionNotFound)?;
        let turn = entry.latest.as_ref().ok_or(ErrorReason::NoTurn)?;
        Ok(turn.content.clone())
    }

    /// Implicit deregistration on connection loss.
    fn drop_connection(&mut self, conn_id: u64) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.conn_id != conn_id);
        before - self.sessions.len()
    }
}

type SharedState = Arc<Mutex<BrokerState>>;

#[derive(Debug)]
pub struct Broker {
    listener: UnixListener,
    socket_path: PathBuf,
    state: SharedState,
}

impl Broker {
    /// Standard startup on the user's runtime directory.
    pub async fn bind() -> Result<Self> {
        let dir = paths::ensure_runtime_dir()?;
        Self::bind_at(&dir.join(paths::SOCKET_NAME)).await
    }

    /// Bind the socket, taking over a stale one from a dead broker but
    /// refusing to displace a live one.
    pub async fn bind_at(socket_path: &Path) -> Result<Self> {
        let listener = match UnixListener::bind(socket_path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if UnixStream::connect(socket_path).await.is_ok() {
                    bail!(
                        "another broker is already listening on {}",
                        socket_path.display()
                    );
                }
                tracing::info!(path = %socket_path.display(), "removing stale socket");
                std::fs::remove_file(socket_path)
                    .with_context(|| format!("failed to unlink {}", socket_path.display()))?;
                UnixListener::bind(socket_path)
                    .with_context(|| format!("failed to bind {}", socket_path.display()))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to bind {}", socket_path.display()))
            }
        };
        tracing::info!(path = %socket_path.display(), "broker listening");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until SIGTERM/SIGINT, then unlink the socket and return.
    pub async fn serve(self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
        let shutdown = async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
        };
        self.serve_with_shutdown(shutdown).await
    }

    /// Serve until `shutdown` resolves. Split out so tests can drive the
    /// lifecycle without process signals.
    pub async fn serve_with_shutdown(self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let mut next_conn_id: u64 = 0;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            next_conn_id += 1;
                            let conn_id = next_conn_id;
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                handle_connection(conn_id, stream, state).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        tracing::info!("broker shutting down");
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(error = %e, "failed to unlink socket");
        }
        Ok(())
    }
}

/// Read the handshake, then serve requests until the peer goes away or
/// commits a framing fault. Wrappers that vanish take their sessions with
/// them.
async fn handle_connection(conn_id: u64, stream: UnixStream, state: SharedState) {
    let (mut reader, mut writer) = stream.into_split();

    // Outbound frames are serialized by a writer task; responses and
    // injects share the queue so per-connection ordering holds.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if write_message(&mut writer, &msg).await.is_err() {
                break;
            }
        }
    });

    let role = match handshake(&mut reader, &outbound_tx).await {
        Some(role) => role,
        None => {
            drop(outbound_tx);
            let _ = writer_task.await;
            return;
        }
    };
    tracing::debug!(conn_id, ?role, "connection established");

    loop {
        let payload = match read_payload(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(FrameError::Oversize(len)) => {
                tracing::warn!(conn_id, len, "oversized frame");
                let _ = outbound_tx.send(Message::error(CONTROL_ID, ErrorReason::PayloadTooLarge));
                break;
            }
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "read failed");
                break;
            }
        };

        match decode_payload(&payload) {
            Ok(request) => {
                let closing = matches!(
                    request,
                    Message::Hello { .. } // repeated hello is a protocol fault
                );
                let response = dispatch(conn_id, role, &outbound_tx, request, &state).await;
                if let Some(response) = response {
                    let close_after = matches!(
                        &response,
                        Message::Response {
                            error: Some(reason),
                            ..
                        } if reason.closes_connection()
                    );
                    if outbound_tx.send(response).is_err() {
                        break;
                    }
                    if close_after || closing {
                        break;
                    }
                }
            }
            Err(DecodeError::UnknownType { msg_type, id }) => {
                tracing::debug!(conn_id, %msg_type, "unknown request type");
                if outbound_tx
                    .send(Message::error(id, ErrorReason::UnknownType))
                    .is_err()
                {
                    break;
                }
            }
            Err(DecodeError::Malformed(e)) => {
                tracing::warn!(conn_id, error = %e, "malformed payload; closing");
                break;
            }
        }
    }

    let dropped = state.lock().drop_connection(conn_id);
    if dropped > 0 {
        tracing::info!(conn_id, sessions = dropped, "implicit deregistration");
    }
    drop(outbound_tx);
    let _ = writer_task.await;
}

/// First frame must be `hello` with a matching version.
async fn handshake(
    reader: &mut tokio::net::unix::OwnedReadHalf,
    outbound: &mpsc::UnboundedSender<Message>,
) -> Option<Role> {
    let payload = match read_payload(reader).await {
        Ok(Some(payload)) => payload,
        _ => return None,
    };
    match decode_payload(&payload) {
        Ok(Message::Hello { version, role, .. }) => {
            if version != PROTOCOL_VERSION {
                let _ = outbound.send(Message::HelloAck {
                    id: CONTROL_ID,
                    status: Status::Error,
                    error: Some(ErrorReason::VersionMismatch),
                });
                return None;
            }
            let _ = outbound.send(Message::HelloAck {
                id: CONTROL_ID,
                status: Status::Ok,
                error: None,
            });
            Some(role)
        }
        _ => {
            tracing::debug!("first frame was not hello; closing");
            None
        }
    }
}

/// Apply one request to shared state and produce its response. State
/// effects are atomic: the lock is taken once per request and never held
/// across an await.
async fn dispatch(
    conn_id: u64,
    role: Role,
    outbound: &mpsc::UnboundedSender<Message>,
    request: Message,
    state: &SharedState,
) -> Option<Message> {
    match request {
        Message::Register {
            id,
            session,
            pid,
            pattern,
        } => {
            let result = state.lock().register(
                conn_id,
                role == Role::Wrapper,
                outbound.clone(),
                session.clone(),
                pid,
                pattern,
            );
            Some(match result {
                Ok(()) => {
                    tracing::info!(%session, pid, "session registered");
                    Message::ok(id)
                }
                Err(reason) => Message::error(id, reason),
            })
        }
        Message::Deregister { id, session } => {
            state.lock().deregister(&session);
            tracing::info!(%session, "session deregistered");
            Some(Message::ok(id))
        }
        Message::TurnCompleted {
            id,
            session,
            content,
            interrupted,
            truncated,
        } => {
            let result = state
                .lock()
                .turn_completed(&session, content, interrupted, truncated);
            Some(match result {
                Ok(turn_id) => Message::Response {
                    id,
                    status: Status::Ok,
                    error: None,
                    size: None,
                    turn_id: Some(turn_id),
                    sessions: None,
                },
                Err(reason) => Message::error(id, reason),
            })
        }
        Message::Capture { id, session } => {
            let result = state.lock().capture(&session);
            Some(match result {
                Ok((size, turn_id)) => {
                    tracing::debug!(%session, size, turn_id, "turn captured");
                    Message::Response {
                        id,
                        status: Status::Ok,
                        error: None,
                        size: Some(size),
                        turn_id: Some(turn_id),
                        sessions: None,
                    }
                }
                Err(reason) => Message::error(id, reason),
            })
        }
        Message::Paste { id, session } => {
            let result = state.lock().paste(&session);
            Some(match result {
                Ok(()) => {
                    tracing::debug!(%session, "relay buffer pasted");
                    Message::ok(id)
                }
                Err(reason) => Message::error(id, reason),
            })
        }
        Message::ListSessions { id } => {
            let sessions = state.lock().list_sessions();
            Some(Message::Response {
                id,
                status: Status::Ok,
                error: None,
                size: None,
                turn_id: None,
                sessions: Some(sessions),
            })
        }
        Message::Deliver {
            id,
            session,
            sink: kind,
            path,
        } => {
            // Read under the lock, deliver outside it.
            let content = match state.lock().latest_turn(&session) {
                Ok(content) => content,
                Err(reason) => return Some(Message::error(id, reason)),
            };
            Some(match sink::deliver(kind, path.as_deref(), &content).await {
                Ok(()) => Message::ok(id),
                Err(reason) => Message::error(id, reason),
            })
        }
        Message::Hello { id, .. } => Some(Message::error(id, ErrorReason::UnknownType)),
        // Inject is broker-to-wrapper only; a peer sending one is confused
        // but harmless. Responses/acks need no reply at all.
        Message::Inject { id, .. } => Some(Message::error(id, ErrorReason::UnknownType)),
        Message::Response { .. } | Message::HelloAck { .. } => None,
    }
}
