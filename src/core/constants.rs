//! Default tuning values and wire constants.
//!
//! Every configurable value here is only a default; [`ManagerConfig`]
//! carries the values a running manager actually uses.
//!
//! [`ManagerConfig`]: crate::client::ManagerConfig

use std::time::Duration;

// =============================================================================
// CONNECTION MANAGER DEFAULTS
// =============================================================================

/// Interval between poll cycles while degraded to polling.
pub const DEFAULT_POLLING_RATE: Duration = Duration::from_millis(2000);

/// Consecutive push failures before falling back to polling.
///
/// `0` disables the fallback entirely (push-only sessions).
pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 3;

/// Push attempts allowed once degraded (upgrade probes), or in push-only
/// mode before the session is given up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Interval between upgrade probes while polling.
pub const DEFAULT_UPGRADE_INTERVAL: Duration = Duration::from_millis(60_000);

// =============================================================================
// BACKOFF (reconnect delays)
// =============================================================================

/// Delay before the first reconnect attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(2000);

/// Upper bound for a reconnect delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(30_000);

/// Largest jitter fraction a policy accepts.
pub const MAX_BACKOFF_JITTER: f64 = 0.1;

/// Exponent cap; `2^20` already saturates any sane maximum.
pub const MAX_BACKOFF_SHIFT: u32 = 20;

// =============================================================================
// OUTBOUND QUEUE
// =============================================================================

/// Messages buffered while no transport can deliver them.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Failed sends tolerated per message before it is dropped.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;

// =============================================================================
// WIRE CONTRACT
// =============================================================================

/// Polling endpoint, relative to the server base URL.
pub const POLL_PATH: &str = "events/poll";

/// One-shot send endpoint, relative to the server base URL.
pub const SEND_PATH: &str = "events/send";

/// Control frame asking the push server to stream a scope from a cursor.
pub const SUBSCRIBE_FRAME: &str = "subscribe";

/// Control frame asking the push server to stop streaming a scope.
pub const UNSUBSCRIBE_FRAME: &str = "unsubscribe";

/// Event type that matches every inbound event.
pub const WILDCARD_EVENT: &str = "*";

/// Time allowed for the push handshake before the attempt counts as `TIMEOUT`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout of the HTTP polling client.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// ENVIRONMENT
// =============================================================================

/// Prefix of every environment variable read by `ManagerConfig::from_env`.
pub const ENV_PREFIX: &str = "RELINK_";
