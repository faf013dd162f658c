//! Transport layer.
//!
//! Building blocks the connection manager drives:
//!
//! - **Backoff**: [`BackoffPolicy`] and [`BackoffState`] for push reconnects
//! - **Cursors**: [`EventCursor`], the per-scope high-water mark and dedup filter
//! - **Outbound queue**: [`OutboundQueue`] and [`flush_batch`]
//! - **Poll timers**: [`PollSchedule`]
//! - **Wire implementations**: [`HttpPolling`] (feature `http`) and
//!   [`WebSocketPush`] (feature `websocket`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         ConnectionManager               │
//! ├─────────────────────────────────────────┤
//! │   backoff, cursors, queue, schedule     │  ← This module
//! ├────────────────────┬────────────────────┤
//! │   PushTransport    │   PollTransport    │
//! │   (WebSocket)      │   (HTTP)           │
//! └────────────────────┴────────────────────┘
//! ```

mod backoff;
mod cursor;
mod queue;
mod schedule;

#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
mod http;

#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
mod websocket;

pub use backoff::{BackoffPolicy, BackoffState};
pub use cursor::EventCursor;
pub use queue::{FlushReport, OutboundQueue, flush_batch};
pub use schedule::PollSchedule;

#[cfg(feature = "http")]
pub use http::HttpPolling;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketPush;
