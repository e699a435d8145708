//! Wire protocol for the broker socket.
//!
//! Frames are a 4-byte big-endian length followed by a MessagePack map
//! payload. Every payload carries `type` and `id`; responses echo the
//! request's `id`, and `id = 0` is reserved for the handshake and for
//! unsolicited broker-to-wrapper messages.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size. A payload of exactly this many bytes is accepted;
/// one byte more is a framing fault that closes the connection.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Reserved request id for `hello`/`hello_ack` and unsolicited `inject`.
pub const CONTROL_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Wrapper,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

/// Error catalogue. Returned in `hello_ack` and `response` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    #[error("session_not_found")]
    SessionNotFound,
    #[error("no_turn")]
    NoTurn,
    #[error("buffer_empty")]
    BufferEmpty,
    #[error("session_disconnected")]
    SessionDisconnected,
    #[error("duplicate_session")]
    DuplicateSession,
    #[error("version_mismatch")]
    VersionMismatch,
    #[error("unknown_type")]
    UnknownType,
    #[error("payload_too_large")]
    PayloadTooLarge,
    #[error("clipboard_failed")]
    ClipboardFailed,
    #[error("file_write_failed")]
    FileWriteFailed,
}

impl ErrorReason {
    /// Framing-level faults close the connection after the response is sent;
    /// request-level faults leave it usable.
    pub fn closes_connection(self) -> bool {
        matches!(
            self,
            ErrorReason::VersionMismatch | ErrorReason::PayloadTooLarge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Clipboard,
    File,
}

/// One row of a `list_sessions` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session: String,
    pub pid: u32,
    pub has_turn: bool,
}

/// The message catalogue. The `type` tag is part of the wire map, so adding
/// variants or fields is non-breaking; receivers ignore unknown fields and
/// answer unknown types with [`ErrorReason::UnknownType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        id: u32,
        version: u32,
        role: Role,
    },
    HelloAck {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorReason>,
    },
    Register {
        id: u32,
        session: String,
        pid: u32,
        pattern: String,
    },
    Deregister {
        id: u32,
        session: String,
    },
    TurnCompleted {
        id: u32,
        session: String,
        #[serde(with = "serde_bytes")]
        content: Vec<u8>,
        interrupted: bool,
        #[serde(default)]
        truncated: bool,
    },
    Capture {
        id: u32,
        session: String,
    },
    Paste {
        id: u32,
        session: String,
    },
    ListSessions {
        id: u32,
    },
    Deliver {
        id: u32,
        session: String,
        sink: SinkKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Broker → wrapper, unsolicited, always `id = 0`. The wrapper writes the
    /// bytes to its PTY master and sends no acknowledgment.
    Inject {
        id: u32,
        #[serde(with = "serde_bytes")]
        content: Vec<u8>,
    },
    Response {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sessions: Option<Vec<SessionInfo>>,
    },
}

impl Message {
    pub fn id(&self) -> u32 {
        match self {
            Message::Hello { id, .. }
            | Message::HelloAck { id, .. }
            | Message::Register { id, .. }
            | Message::Deregister { id, .. }
            | Message::TurnCompleted { id, .. }
            | Message::Capture { id, .. }
            | Message::Paste { id, .. }
            | Message::ListSessions { id }
            | Message::Deliver { id, .. }
            | Message::Inject { id, .. }
            | Message::Response { id, .. } => *id,
        }
    }

    pub fn ok(id: u32) -> Message {
        Message::Response {
            id,
            status: Status::Ok,
            error: None,
            size: None,
            turn_id: None,
            sessions: None,
        }
    }

    pub fn error(id: u32, reason: ErrorReason) -> Message {
        Message::Response {
            id,
            status: Status::Error,
            error: Some(reason),
            size: None,
            turn_id: None,
            sessions: None,
        }
    }
}

/// Minimal view of any payload, used to salvage the request id when the full
/// message fails to decode (unknown type, unexpected shape).
#[derive(Debug, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    id: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit")]
    Oversize(usize),
    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload was a well-formed map with an unrecognized `type`.
    #[error("unknown message type {msg_type:?} (id {id})")]
    UnknownType { msg_type: String, id: u32 },
    /// The payload was not a usable MessagePack map at all.
    #[error("malformed payload: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),
}

/// Encode a message into a length-prefixed frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = rmp_serde::to_vec_named(msg)?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(FrameError::Oversize(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

const KNOWN_TYPES: &[&str] = &[
    "hello",
    "hello_ack",
    "register",
    "deregister",
    "turn_completed",
    "capture",
    "paste",
    "list_sessions",
    "deliver",
    "inject",
    "response",
];

/// Decode a payload, distinguishing unknown types (recoverable) from
/// malformed framing (fatal). A recognized type that fails to decode is a
/// shape fault, not an unknown type.
pub fn decode_payload(payload: &[u8]) -> Result<Message, DecodeError> {
    match rmp_serde::from_slice::<Message>(payload) {
        Ok(msg) => Ok(msg),
        Err(err) => match rmp_serde::from_slice::<Header>(payload) {
            Ok(header) if !KNOWN_TYPES.contains(&header.msg_type.as_str()) => {
                Err(DecodeError::UnknownType {
                    msg_type: header.msg_type,
                    id: header.id,
                })
            }
            _ => Err(DecodeError::Malformed(err)),
        },
    }
}

/// Read one payload off the stream. Returns `Ok(None)` on clean EOF before
/// the length prefix. Oversized lengths are rejected before any payload
/// bytes are read.
pub async fn read_payload<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PAYLOAD_BYTES {
        return Err(FrameError::Oversize(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        let decoded = decode_payload(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn hello_round_trip() {
        round_trip(Message::Hello {
            id: CONTROL_ID,
            version: PROTOCOL_VERSION,
            role: Role::Wrapper,
        });
        round_trip(Message::HelloAck {
            id: CONTROL_ID,
            status: Status::Error,
            error: Some(ErrorReason::VersionMismatch),
        });
    }

    #[test]
    fn register_round_trip() {
        round_trip(Message::Register {
            id: 1,
            session: "s-1".into(),
            pid: 4242,
            pattern: "^> $".into(),
        });
        round_trip(Message::Deregister {
            id: 2,
            session: "s-1".into(),
        });
    }

    #[test]
    fn turn_content_is_byte_exact() {
        // Invalid UTF-8 and embedded ANSI must survive unchanged.
        let content = vec![0x1b, b'[', b'3', b'1', b'm', 0xff, 0xfe, b'\n', 0x00];
        let msg = Message::TurnCompleted {
            id: 3,
            session: "s-1".into(),
            content: content.clone(),
            interrupted: true,
            truncated: false,
        };
        let frame = encode_frame(&msg).unwrap();
        match decode_payload(&frame[4..]).unwrap() {
            Message::TurnCompleted {
                content: decoded, ..
            } => assert_eq!(decoded, content),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn inject_round_trip() {
        round_trip(Message::Inject {
            id: CONTROL_ID,
            content: b"hello\n".to_vec(),
        });
    }

    #[test]
    fn response_round_trip() {
        round_trip(Message::ok(9));
        round_trip(Message::error(9, ErrorReason::NoTurn));
        round_trip(Message::Response {
            id: 10,
            status: Status::Ok,
            error: None,
            size: Some(6),
            turn_id: Some(17),
            sessions: Some(vec![SessionInfo {
                session: "s-1".into(),
                pid: 1,
                has_turn: true,
            }]),
        });
    }

    #[test]
    fn deliver_round_trip() {
        round_trip(Message::Deliver {
            id: 4,
            session: "s-1".into(),
            sink: SinkKind::File,
            path: Some("/tmp/out.txt".into()),
        });
        round_trip(Message::Deliver {
            id: 5,
            session: "s-1".into(),
            sink: SinkKind::Clipboard,
            path: None,
        });
    }

    #[test]
    fn unknown_type_keeps_request_id() {
        #[derive(Serialize)]
        struct Bogus {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            extra: &'static str,
        }
        let payload = rmp_serde::to_vec_named(&Bogus {
            msg_type: "list_turns",
            id: 77,
            extra: "ignored",
        })
        .unwrap();
        match decode_payload(&payload) {
            Err(DecodeError::UnknownType { msg_type, id }) => {
                assert_eq!(msg_type, "list_turns");
                assert_eq!(id, 77);
            }
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_fields_are_ignored() {
        #[derive(Serialize)]
        struct Future {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            session: &'static str,
            some_v2_field: u64,
        }
        let payload = rmp_serde::to_vec_named(&Future {
            msg_type: "capture",
            id: 3,
            session: "s-9",
            some_v2_field: 99,
        })
        .unwrap();
        match decode_payload(&payload).unwrap() {
            Message::Capture { id, session } => {
                assert_eq!(id, 3);
                assert_eq!(session, "s-9");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn known_type_with_bad_shape_is_malformed() {
        #[derive(Serialize)]
        struct MissingSession {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
        }
        let payload = rmp_serde::to_vec_named(&MissingSession {
            msg_type: "capture",
            id: 8,
        })
        .unwrap();
        assert!(matches!(
            decode_payload(&payload),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_payload(&[0xc1, 0x00, 0x01]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn payload_at_limit_is_accepted() {
        let mut frame = Vec::with_capacity(4 + MAX_PAYLOAD_BYTES);
        frame.extend_from_slice(&(MAX_PAYLOAD_BYTES as u32).to_be_bytes());
        frame.resize(4 + MAX_PAYLOAD_BYTES, 0xc0);
        let mut cursor = std::io::Cursor::new(frame);
        let payload = read_payload(&mut cursor).await.unwrap().unwrap();
        assert_eq!(payload.len(), MAX_PAYLOAD_BYTES);
    }

    #[tokio::test]
    async fn payload_over_limit_is_rejected_before_read() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_PAYLOAD_BYTES + 1) as u32).to_be_bytes());
        // No payload bytes follow; the length alone must trigger the error.
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_payload(&mut cursor).await,
            Err(FrameError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn eof_before_length_is_clean_close() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_payload(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn payload_is_a_map_with_string_keys() {
        let frame = encode_frame(&Message::ListSessions { id: 1 }).unwrap();
        // MessagePack fixmap markers are 0x80..=0x8f.
        assert!(matches!(frame[4], 0x80..=0x8f));
    }
}
