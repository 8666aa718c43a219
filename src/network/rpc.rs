//! RPC message types and framing.
//!
//! Every message is bincode-encoded and sent with a 4-byte big-endian
//! length prefix. Frames larger than [`MAX_FRAME_SIZE`] are refused on both
//! ends.

use crate::error::{Error, MigrationError, NetworkError, Result};
use crate::types::{ExecOutcome, RoutingKey, RowSet, ShardName};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Message returned by successful register, remove and migrate calls.
pub const SUCCESS_MESSAGE: &str = "Success";

/// Envelope for everything sent over a gateway connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request {
        request_id: u64,
        body: GatewayRequest,
    },
    Response {
        request_id: u64,
        body: GatewayResponse,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayRequest {
    /// Run a row-returning statement on the key's shard.
    Query { key: RoutingKey, sql: String },

    /// Run a modifying statement on the key's shard.
    Exec { key: RoutingKey, sql: String },

    RegisterKey { key: RoutingKey, shard: ShardName },

    RemoveKey { key: RoutingKey },

    /// Move the key's partition to `to_shard` and switch its route.
    MigrateShard { key: RoutingKey, to_shard: ShardName },

    Ping,

    /// Current gateway metrics in Prometheus text format.
    Metrics,
}

impl GatewayRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayRequest::Query { .. } => "query",
            GatewayRequest::Exec { .. } => "exec",
            GatewayRequest::RegisterKey { .. } => "register_key",
            GatewayRequest::RemoveKey { .. } => "remove_key",
            GatewayRequest::MigrateShard { .. } => "migrate_shard",
            GatewayRequest::Ping => "ping",
            GatewayRequest::Metrics => "metrics",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayResponse {
    Rows(RowSet),
    Exec(ExecResponse),
    Simple(SimpleResult),
    Pong,
    Metrics(String),
    Error(ErrorResponse),
}

/// Exec result as sent on the wire.
///
/// A field the shard cannot report carries [`crate::EXEC_UNSUPPORTED_SENTINEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub rows_affected: i64,
    pub last_insert_id: i64,
}

impl From<ExecOutcome> for ExecResponse {
    fn from(outcome: ExecOutcome) -> Self {
        Self {
            rows_affected: outcome.rows_affected_or_sentinel(),
            last_insert_id: outcome.last_insert_id_or_sentinel(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleResult {
    pub success: bool,
    pub message: String,
}

impl SimpleResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: SUCCESS_MESSAGE.to_string(),
        }
    }
}

/// Error categories distinguishable by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Input,
    KeyNotFound,
    UnknownShard,
    Connection,
    Query,
    MigrationCopyFailed,
    MigrationCutoverRejected,
    MigrationDrainTimeout,
    MigrationInProgress,
    Timeout,
    /// The gateway is shutting down.
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Input => "input",
            ErrorKind::KeyNotFound => "key_not_found",
            ErrorKind::UnknownShard => "unknown_shard",
            ErrorKind::Connection => "connection",
            ErrorKind::Query => "query",
            ErrorKind::MigrationCopyFailed => "migration_copy_failed",
            ErrorKind::MigrationCutoverRejected => "migration_cutover_rejected",
            ErrorKind::MigrationDrainTimeout => "migration_drain_timeout",
            ErrorKind::MigrationInProgress => "migration_in_progress",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    /// The routing key or shard name the error is about, when there is one.
    pub subject: Option<String>,
}

impl ErrorResponse {
    /// Rebuild a typed error on the client side.
    pub fn into_error(self) -> Error {
        match (self.kind, self.subject) {
            (ErrorKind::Input, _) => Error::Input(self.message),
            (ErrorKind::Query, _) => Error::Query(self.message),
            (ErrorKind::KeyNotFound, Some(key)) => Error::KeyNotFound(key.into()),
            (ErrorKind::UnknownShard, Some(shard)) => Error::UnknownShard(shard.into()),
            (ErrorKind::Timeout, _) => Error::Timeout,
            (kind, _) => Error::Remote {
                kind,
                message: self.message,
            },
        }
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        let (kind, subject) = match err {
            Error::Input(_) => (ErrorKind::Input, None),
            Error::KeyNotFound(key) => (ErrorKind::KeyNotFound, Some(key.to_string())),
            Error::UnknownShard(shard) => (ErrorKind::UnknownShard, Some(shard.to_string())),
            Error::Connection(_) => (ErrorKind::Connection, None),
            Error::Query(_) => (ErrorKind::Query, None),
            Error::Migration(MigrationError::CopyFailed { key, .. }) => {
                (ErrorKind::MigrationCopyFailed, Some(key.to_string()))
            }
            Error::Migration(MigrationError::CutoverRejected { key, .. }) => {
                (ErrorKind::MigrationCutoverRejected, Some(key.to_string()))
            }
            Error::Migration(MigrationError::DrainTimeout { key, .. }) => {
                (ErrorKind::MigrationDrainTimeout, Some(key.to_string()))
            }
            Error::Migration(MigrationError::InProgress(key)) => {
                (ErrorKind::MigrationInProgress, Some(key.to_string()))
            }
            Error::Timeout => (ErrorKind::Timeout, None),
            Error::Fatal(_) | Error::Cancelled => (ErrorKind::Unavailable, None),
            Error::Remote { kind, .. } => (*kind, None),
            Error::Network(_) | Error::Config(_) | Error::Internal(_) => {
                (ErrorKind::Internal, None)
            }
        };

        // Input and query messages go back verbatim; the rest carry the
        // full error text.
        let message = match err {
            Error::Input(m) | Error::Query(m) => m.clone(),
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };

        Self {
            kind,
            message,
            subject,
        }
    }
}

impl From<Error> for GatewayResponse {
    fn from(err: Error) -> Self {
        GatewayResponse::Error(ErrorResponse::from(&err))
    }
}

pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode_message(data: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(data)?)
}

/// Length-prefix an encoded message for the wire.
pub fn frame_message(msg: &Message) -> Result<Bytes> {
    let data = encode_message(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut framed = BytesMut::with_capacity(4 + data.len());
    framed.put_u32(data.len() as u32);
    framed.extend_from_slice(&data);
    Ok(framed.freeze())
}

/// Read one framed message. Returns `None` on a clean close between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    };

    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    reader
        .read_exact(&mut buf)
        .await
        .map_err(NetworkError::Io)?;

    decode_message(&buf).map(Some)
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Value, EXEC_UNSUPPORTED_SENTINEL};

    #[test]
    fn test_frame_has_length_prefix() {
        let msg = Message::Request {
            request_id: 7,
            body: GatewayRequest::Query {
                key: "tenant1".into(),
                sql: "SELECT * FROM users".into(),
            },
        };

        let framed = frame_message(&msg).unwrap();
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
        assert_eq!(decode_message(&framed[4..]).unwrap(), msg);
    }

    #[test]
    fn test_exec_response_uses_sentinel() {
        let resp = ExecResponse::from(ExecOutcome::new(Some(3), None));
        assert_eq!(resp.rows_affected, 3);
        assert_eq!(resp.last_insert_id, EXEC_UNSUPPORTED_SENTINEL);
        assert_eq!(resp.last_insert_id, -2147483648);
    }

    #[test]
    fn test_error_response_keeps_query_message_verbatim() {
        let resp = ErrorResponse::from(&Error::Query("no such table: users".into()));
        assert_eq!(resp.kind, ErrorKind::Query);
        assert_eq!(resp.message, "no such table: users");

        let resp = ErrorResponse::from(&Error::Input("key is empty".into()));
        assert_eq!(resp.message, "key is empty");
        assert!(matches!(resp.into_error(), Error::Input(m) if m == "key is empty"));
    }

    #[test]
    fn test_error_response_round_trips_subject() {
        let resp = ErrorResponse::from(&Error::KeyNotFound("tenant9".into()));
        assert_eq!(resp.subject.as_deref(), Some("tenant9"));
        match resp.into_error() {
            Error::KeyNotFound(key) => assert_eq!(key.as_str(), "tenant9"),
            other => panic!("unexpected error: {:?}", other),
        }

        let resp = ErrorResponse::from(&Error::Migration(MigrationError::InProgress(
            "tenant1".into(),
        )));
        assert_eq!(resp.kind, ErrorKind::MigrationInProgress);
        assert!(matches!(
            resp.into_error(),
            Error::Remote {
                kind: ErrorKind::MigrationInProgress,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_read_write_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::Response {
            request_id: 1,
            body: GatewayResponse::Rows(RowSet::new(
                vec!["id".into()],
                vec![vec![Value::Integer(1)], vec![Value::Null]],
            )),
        };

        write_message(&mut a, &msg).await.unwrap();
        drop(a);

        assert_eq!(read_message(&mut b).await.unwrap(), Some(msg));
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();

        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::FrameTooLarge { .. })
        ));
    }
}
