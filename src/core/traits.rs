//! Transport traits.
//!
//! The connection manager is generic over one [`PushTransport`] and one
//! [`PollTransport`]. Implementations only do I/O; timers, retries, cursor
//! bookkeeping and failover all live in the manager.

use std::future::Future;

use tokio::sync::mpsc;

use super::error::{ConnectionError, PollingError, SendError};
use super::event::{PollRequest, PollResponse, SendRequest, WireEvent};

/// Something a push connection reports after `open` resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum PushSignal {
    /// An inbound event envelope.
    Event(WireEvent),
    /// The connection closed or errored; the transport is no longer open.
    Closed(ConnectionError),
}

/// Callback handle given to [`PushTransport::open`].
///
/// Every sink is stamped with the epoch of the connection attempt that
/// created it. Signals from a sink whose epoch is no longer current are
/// discarded by the manager, so a superseded connection cannot touch state
/// after teardown.
#[derive(Debug, Clone)]
pub struct PushSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, PushSignal)>,
}

impl PushSink {
    /// Create a sink and the receiving end of its channel.
    pub fn channel(epoch: u64) -> (Self, mpsc::UnboundedReceiver<(u64, PushSignal)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { epoch, tx }, rx)
    }

    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, PushSignal)>) -> Self {
        Self { epoch, tx }
    }

    /// Epoch of the attempt this sink belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Forward an inbound event.
    ///
    /// Returns `false` once nobody is listening any more; the transport
    /// should stop reading.
    pub fn event(&self, event: WireEvent) -> bool {
        self.tx.send((self.epoch, PushSignal::Event(event))).is_ok()
    }

    /// Report that the connection is gone.
    pub fn closed(&self, error: ConnectionError) {
        let _ = self.tx.send((self.epoch, PushSignal::Closed(error)));
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A persistent bidirectional connection.
///
/// # Contract
///
/// - `open` resolves exactly once per call. Calling it while already open is
///   a no-op that resolves `Ok(())` and keeps the original sink.
/// - After `open` resolved `Ok`, inbound envelopes and the eventual loss of
///   the connection are reported through the sink.
/// - `close` detaches the sink: no signal may be sent after it returns.
pub trait PushTransport: Send + Sync + 'static {
    /// Establish the underlying connection.
    fn open(&self, sink: PushSink) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Tear the connection down. Closing a closed transport is a no-op.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Send one outbound frame.
    fn send(&self, frame: &SendRequest) -> impl Future<Output = Result<(), SendError>> + Send;
}

/// Request/response half of the polling transport.
///
/// Each call is independent: a failure says nothing about the next one.
pub trait PollTransport: Send + Sync + 'static {
    /// Fetch events newer than `request.last_timestamp` for one scope.
    fn poll(
        &self,
        request: &PollRequest,
    ) -> impl Future<Output = Result<PollResponse, PollingError>> + Send;

    /// Deliver one outbound frame with a single request.
    fn send_once(&self, frame: &SendRequest) -> impl Future<Output = Result<(), SendError>> + Send;
}
