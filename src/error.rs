//! Error types for the sharding gateway.

use crate::types::{RoutingKey, ShardName};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed client input (empty routing key, no-op migration).
    #[error("input error: {0}")]
    Input(String),

    /// The routing key has no routing entry.
    #[error("key not found: {0}")]
    KeyNotFound(RoutingKey),

    /// The shard name is not present in configuration.
    #[error("unknown shard: {0}")]
    UnknownShard(ShardName),

    /// A registered shard's connection cannot be built or reused.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The shard rejected the statement. The driver's message is kept verbatim.
    #[error("{0}")]
    Query(String),

    /// Migration failures. The routing table is left at its pre-migration value.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Process-fatal condition raised through the supervision tree.
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),

    /// RPC transport errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Error reported by a remote gateway that has no local counterpart.
    #[error("remote {kind} error: {message}")]
    Remote {
        kind: crate::network::ErrorKind,
        message: String,
    },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is scoped to a single request.
    pub fn is_request_scoped(&self) -> bool {
        !matches!(self, Error::Fatal(_))
    }
}

/// Failures to build or reuse a shard connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The shard could not be reached when building its connection.
    #[error("shard {shard} unreachable: {reason}")]
    Unreachable { shard: ShardName, reason: String },

    /// The cached connection was closed (gateway shutting down).
    #[error("connection to shard {0} is closed")]
    Closed(ShardName),

    /// A liveness probe failed.
    #[error("probe of shard {shard} failed: {reason}")]
    ProbeFailed { shard: ShardName, reason: String },
}

/// Migration-specific failures.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Copy or verification of the key's partition failed; cutover never ran.
    #[error("copy of key {key} from {source_shard} to {dest_shard} failed: {reason}")]
    CopyFailed {
        key: RoutingKey,
        source_shard: ShardName,
        dest_shard: ShardName,
        reason: String,
    },

    /// The cutover callback refused the routing switch.
    #[error("cutover of key {key} to {dest_shard} rejected: {reason}")]
    CutoverRejected {
        key: RoutingKey,
        dest_shard: ShardName,
        reason: String,
    },

    /// In-flight requests did not drain before the timeout.
    #[error("drain before cutover of key {key} timed out after {timeout:?}")]
    DrainTimeout { key: RoutingKey, timeout: Duration },

    /// Another migration of the same key is running.
    #[error("migration of key {0} already in progress")]
    InProgress(RoutingKey),
}

/// Conditions that stop the whole gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The RPC listener could not start or died.
    #[error("listener failed: {0}")]
    ListenerFailed(String),

    /// A shard kept failing probes beyond the tolerance.
    #[error("shard {shard} unreachable after {failures} consecutive probe failures: {reason}")]
    ShardUnreachable {
        shard: ShardName,
        failures: u32,
        reason: String,
    },

    /// A supervised task ended with a terminal failure.
    #[error("task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },
}

/// RPC transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame exceeded the maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with an unexpected message.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
