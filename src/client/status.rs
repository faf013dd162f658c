//! Observable connection status.

use serde::{Deserialize, Serialize};

use crate::core::ErrorKind;

/// Connection manager state. Exactly one is active at any instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport, no timers.
    #[default]
    Disconnected,
    /// A push connection attempt is in flight.
    Connecting,
    /// Push is the active transport.
    ConnectedPush,
    /// Polling is the active transport.
    ConnectedPoll,
    /// Waiting for the backoff delay before the next push attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Whether a transport is delivering events.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedPush | Self::ConnectedPoll)
    }

    /// The active transport kind.
    pub fn connection_type(self) -> ConnectionType {
        match self {
            Self::ConnectedPush => ConnectionType::Push,
            Self::ConnectedPoll => ConnectionType::Poll,
            _ => ConnectionType::None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::ConnectedPush => "CONNECTED_PUSH",
            Self::ConnectedPoll => "CONNECTED_POLL",
            Self::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

/// Which transport is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Persistent push connection.
    Push,
    /// HTTP polling.
    Poll,
    /// Nothing is connected.
    #[default]
    None,
}

/// Snapshot of the manager's health, for status indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// A transport is delivering events.
    pub is_connected: bool,
    /// The active transport.
    pub connection_type: ConnectionType,
    /// The session has degraded to polling.
    pub use_polling: bool,
    /// Consecutive failed push attempts.
    pub reconnect_attempts: u32,
    /// Most recent error, cleared once healthy again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
    /// Exact state of the manager.
    pub state: ConnectionState,
}

impl ConnectionStatus {
    /// Derive a status from the manager's bookkeeping.
    pub fn compute(
        state: ConnectionState,
        use_polling: bool,
        reconnect_attempts: u32,
        last_error: Option<ErrorKind>,
    ) -> Self {
        Self {
            is_connected: state.is_connected(),
            connection_type: state.connection_type(),
            use_polling,
            reconnect_attempts,
            last_error,
            state,
        }
    }
}
