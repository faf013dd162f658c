//! Error types for the relink transport layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::OutboundMessage;

/// Why a push connection could not be opened or was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionFailure {
    /// The server (or something in between) refused or dropped the connection.
    Refused,
    /// No handshake or traffic within the allowed time.
    Timeout,
    /// The peer violated the protocol or sent an unusable close.
    ProtocolError,
}

impl ConnectionFailure {
    /// Map a WebSocket close code onto a failure reason.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            // normal, going away, policy violation, restart, try again later
            1000 | 1001 | 1008 | 1012 | 1013 => Self::Refused,
            // abnormal closure (no close frame), plus the common app-level timeout code
            1006 | 4408 => Self::Timeout,
            _ => Self::ProtocolError,
        }
    }
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refused => write!(f, "REFUSED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::ProtocolError => write!(f, "PROTOCOL_ERROR"),
        }
    }
}

/// Push open or keepalive failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection {reason}: {message}")]
pub struct ConnectionError {
    /// Classified reason.
    pub reason: ConnectionFailure,
    /// Human-readable detail.
    pub message: String,
}

impl ConnectionError {
    /// Create a connection error.
    pub fn new(reason: ConnectionFailure, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Connection refused or dropped.
    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ConnectionFailure::Refused, message)
    }

    /// Connection timed out.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectionFailure::Timeout, message)
    }

    /// Protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ConnectionFailure::ProtocolError, message)
    }
}

/// HTTP failure during a single poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollingError {
    /// The request never produced a response.
    #[error("poll request failed: {0}")]
    Request(String),

    /// The server answered with a non-success status.
    #[error("poll rejected with HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The response body was not a valid poll response.
    #[error("malformed poll response: {0}")]
    Decode(String),
}

/// Outbound delivery failure on either transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The underlying connection or request failed.
    #[error("send failed: {0}")]
    Transport(String),

    /// The server answered `success: false` or a non-success status.
    #[error("server rejected the message")]
    Rejected,

    /// The transport has no open connection to send on.
    #[error("transport is not connected")]
    NotConnected,

    /// The frame could not be serialized.
    #[error("could not encode frame: {0}")]
    Encode(String),
}

/// The outbound buffer was full and a message was evicted to make room.
#[derive(Debug, Clone, Error)]
#[error("outbound queue full (capacity {capacity}); dropped `{}` for {}", .dropped.event_type, .dropped.scope)]
pub struct QueueOverflow {
    /// Queue capacity at the time of eviction.
    pub capacity: usize,
    /// The message that was evicted.
    pub dropped: OutboundMessage,
}

/// A scope key string that is not `user/server/channel`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid scope key `{0}`: expected `user/server/channel`")]
pub struct ScopeParseError(pub String);

/// Error category reported in [`ConnectionStatus`](crate::client::ConnectionStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Push connection failure.
    Connection(ConnectionFailure),
    /// A poll cycle failed.
    Polling,
    /// An outbound message could not be delivered.
    Send,
    /// The outbound queue evicted a message.
    QueueOverflow,
}

/// Top-level relink errors.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// Push connection error.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Polling error.
    #[error(transparent)]
    Polling(#[from] PollingError),

    /// Send error.
    #[error(transparent)]
    Send(#[from] SendError),

    /// Outbound queue overflow.
    #[error(transparent)]
    QueueOverflow(#[from] QueueOverflow),

    /// Invalid scope key.
    #[error(transparent)]
    InvalidScope(#[from] ScopeParseError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// No tokio runtime to run the connection manager on.
    #[error("a tokio runtime is required to start the connection manager")]
    NoRuntime,

    /// The connection manager has been disposed.
    #[error("connection manager is closed")]
    Closed,
}

impl LinkError {
    /// Status category of this error, if it has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Connection(e) => Some(ErrorKind::Connection(e.reason)),
            Self::Polling(_) => Some(ErrorKind::Polling),
            Self::Send(_) => Some(ErrorKind::Send),
            Self::QueueOverflow(_) => Some(ErrorKind::QueueOverflow),
            Self::InvalidScope(_) | Self::Config(_) | Self::NoRuntime | Self::Closed => None,
        }
    }

    /// Whether the session ended and only a new `connect()` can resume it.
    ///
    /// The manager only ever reports connection errors on the error channel
    /// once every allowed push attempt is spent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }
}
