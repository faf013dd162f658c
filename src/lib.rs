//! # relink
//!
//! Resilient real-time transport: one subscribe/emit API over a persistent
//! push connection that degrades to HTTP polling when push is unavailable and
//! upgrades back once it recovers.
//!
//! - **Failover**: exponential reconnect backoff, fallback to polling after
//!   `maxConnectionAttempts` failures, periodic upgrade probes while degraded
//! - **Exactly-once delivery**: a per-scope timestamp cursor shared by both
//!   transports drops replays across every transport switch
//! - **Ordered outbound**: emitted messages queue while disconnected and
//!   flush in enqueue order on whichever transport is up
//! - **Observability**: a status snapshot and watch channel for UI indicators
//!
//! ## Feature Flags
//!
//! - `http` (default): [`HttpPolling`](transport::HttpPolling), the reqwest
//!   implementation of the polling wire contract
//! - `websocket` (default): [`WebSocketPush`](transport::WebSocketPush), the
//!   tokio-tungstenite implementation of the push wire contract
//!
//! ## Modules
//!
//! - [`core`]: Constants, errors, event and wire types, transport traits
//! - [`transport`]: Backoff, cursors, outbound queue, poll timers, transports
//! - [`client`]: [`ConnectionManager`] and its configuration and status
//!
//! ## Example Usage
//!
//! ```rust
//! use relink::prelude::*;
//!
//! let config = ManagerConfig::builder()
//!     .max_connection_attempts(3)
//!     .upgrade_interval(std::time::Duration::from_secs(60))
//!     .build();
//! assert!(config.validate().is_ok());
//!
//! let policy = config.backoff_policy();
//! let delays: Vec<u128> = (0..6).map(|n| policy.delay(n).as_millis()).collect();
//! assert_eq!(delays, [2000, 4000, 8000, 16000, 30000, 30000]);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport building blocks and wire implementations
pub mod transport;

// Client API
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types and traits
    pub use crate::core::*;

    // Client API
    pub use crate::client::*;

    // Transport implementations (when enabled)
    #[cfg(feature = "http")]
    pub use crate::transport::HttpPolling;
    #[cfg(feature = "websocket")]
    pub use crate::transport::WebSocketPush;
}

// Re-export commonly used items at crate root
pub use crate::client::{
    ConnectionManager, ConnectionState, ConnectionStatus, ConnectionType, HandlerId, ManagerConfig,
    ManagerConfigBuilder,
};
pub use crate::core::{InboundEvent, LinkError, PollTransport, PushTransport, ScopeKey};
