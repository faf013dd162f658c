//! Scripted transports for driving the connection manager under paused time.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relink::core::{
    ConnectionError, InboundEvent, LinkError, PollRequest, PollResponse, PollTransport,
    PollingError, PushSink, PushTransport, ScopeKey, SendError, SendRequest, WireEvent,
};
use relink::{ConnectionManager, ManagerConfig};
use tokio::time::Instant;

pub fn scope() -> ScopeKey {
    ScopeKey::new("u1", "s1", "general")
}

pub fn event(event_type: &str, timestamp: i64) -> WireEvent {
    WireEvent::new(event_type, serde_json::json!({ "ts": timestamp }), timestamp)
}

pub fn manager(config: ManagerConfig, push: &ScriptedPush, poll: &ScriptedPolling) -> ConnectionManager {
    ConnectionManager::new(config, push.clone(), poll.clone()).expect("valid manager")
}

/// Let the manager task run without moving the clock past any of its timers.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Advance paused time by `ms` milliseconds.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

/// Collect every event of `event_type` the manager delivers.
pub fn record(manager: &ConnectionManager, event_type: &str) -> Arc<Mutex<Vec<InboundEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on(event_type, move |e: &InboundEvent| sink.lock().unwrap().push(e.clone()));
    seen
}

/// Collect every error reported on the error channel.
pub fn record_errors(manager: &ConnectionManager) -> Arc<Mutex<Vec<LinkError>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on_error(move |e: &LinkError| sink.lock().unwrap().push(e.clone()));
    seen
}

pub fn timestamps(events: &Arc<Mutex<Vec<InboundEvent>>>) -> Vec<i64> {
    events.lock().unwrap().iter().map(|e| e.timestamp).collect()
}

// =============================================================================
// Push
// =============================================================================

#[derive(Default)]
struct PushScript {
    outcomes: VecDeque<Result<(), ConnectionError>>,
    accept_by_default: bool,
    opens: Vec<Instant>,
    sinks: Vec<PushSink>,
    frames: Vec<SendRequest>,
    open: bool,
    closes: usize,
    failing_sends: usize,
    send_delay: Option<Duration>,
}

/// Push transport whose open outcomes are scripted by the test.
#[derive(Clone, Default)]
pub struct ScriptedPush {
    inner: Arc<Mutex<PushScript>>,
}

impl ScriptedPush {
    /// Every open is refused unless scripted otherwise.
    pub fn refusing() -> Self {
        Self::default()
    }

    /// Every open succeeds unless scripted otherwise.
    pub fn accepting() -> Self {
        let push = Self::default();
        push.inner.lock().unwrap().accept_by_default = true;
        push
    }

    /// Queue explicit outcomes for the next opens.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), ConnectionError>>) {
        self.inner.lock().unwrap().outcomes.extend(outcomes);
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.inner.lock().unwrap().opens.clone()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().opens.len()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    pub fn closes(&self) -> usize {
        self.inner.lock().unwrap().closes
    }

    /// Every frame sent successfully, control frames included.
    pub fn frames(&self) -> Vec<SendRequest> {
        self.inner.lock().unwrap().frames.clone()
    }

    /// Subscribe frames, in order.
    pub fn subscribes(&self) -> Vec<SendRequest> {
        self.frames()
            .into_iter()
            .filter(|f| f.event_type == "subscribe")
            .collect()
    }

    /// Application frames, in order.
    pub fn app_frames(&self) -> Vec<SendRequest> {
        self.frames().into_iter().filter(|f| !f.is_control()).collect()
    }

    /// Fail the next `n` application sends.
    pub fn fail_sends(&self, n: usize) {
        self.inner.lock().unwrap().failing_sends = n;
    }

    /// Hold every application send for `delay` before it reaches the wire.
    pub fn delay_sends(&self, delay: Duration) {
        self.inner.lock().unwrap().send_delay = Some(delay);
    }

    /// The sink handed to the `index`-th successful open.
    pub fn sink(&self, index: usize) -> PushSink {
        self.inner.lock().unwrap().sinks[index].clone()
    }

    /// Deliver an event on the live connection.
    pub fn deliver(&self, event: WireEvent) -> bool {
        let sink = self.inner.lock().unwrap().sinks.last().cloned();
        sink.is_some_and(|sink| sink.event(event))
    }

    /// Simulate the server dropping the live connection.
    pub fn drop_connection(&self, error: ConnectionError) {
        let sink = {
            let mut script = self.inner.lock().unwrap();
            script.open = false;
            script.sinks.last().cloned()
        };
        if let Some(sink) = sink {
            sink.closed(error);
        }
    }
}

impl PushTransport for ScriptedPush {
    async fn open(&self, sink: PushSink) -> Result<(), ConnectionError> {
        let mut script = self.inner.lock().unwrap();
        script.opens.push(Instant::now());
        if script.open {
            return Ok(());
        }

        let outcome = match script.outcomes.pop_front() {
            Some(outcome) => outcome,
            None if script.accept_by_default => Ok(()),
            None => Err(ConnectionError::refused("connection refused")),
        };
        if outcome.is_ok() {
            script.open = true;
            script.sinks.push(sink);
        }
        outcome
    }

    async fn close(&self) {
        let mut script = self.inner.lock().unwrap();
        script.open = false;
        script.closes += 1;
    }

    async fn send(&self, frame: &SendRequest) -> Result<(), SendError> {
        let delay = self.inner.lock().unwrap().send_delay;
        if let Some(delay) = delay.filter(|_| !frame.is_control()) {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.inner.lock().unwrap();
        if !script.open {
            return Err(SendError::NotConnected);
        }
        if !frame.is_control() && script.failing_sends > 0 {
            script.failing_sends -= 1;
            return Err(SendError::Transport("connection reset".into()));
        }
        script.frames.push(frame.clone());
        Ok(())
    }
}

// =============================================================================
// Polling
// =============================================================================

#[derive(Default)]
struct PollScript {
    responses: HashMap<ScopeKey, VecDeque<Result<PollResponse, PollingError>>>,
    requests: Vec<(Instant, PollRequest)>,
    sent: Vec<SendRequest>,
    failing_sends: usize,
}

/// Polling transport answering from per-scope scripts; unscripted polls
/// return no events.
#[derive(Clone, Default)]
pub struct ScriptedPolling {
    inner: Arc<Mutex<PollScript>>,
}

impl ScriptedPolling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for `scope`.
    pub fn respond(&self, scope: &ScopeKey, events: Vec<WireEvent>) {
        self.inner
            .lock()
            .unwrap()
            .responses
            .entry(scope.clone())
            .or_default()
            .push_back(Ok(PollResponse { events }));
    }

    /// Queue a failed cycle for `scope`.
    pub fn fail(&self, scope: &ScopeKey, error: PollingError) {
        self.inner
            .lock()
            .unwrap()
            .responses
            .entry(scope.clone())
            .or_default()
            .push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<(Instant, PollRequest)> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn fail_sends(&self, n: usize) {
        self.inner.lock().unwrap().failing_sends = n;
    }
}

impl PollTransport for ScriptedPolling {
    async fn poll(&self, request: &PollRequest) -> Result<PollResponse, PollingError> {
        let mut script = self.inner.lock().unwrap();
        script.requests.push((Instant::now(), request.clone()));
        script
            .responses
            .get_mut(&request.scope())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(PollResponse::default()))
    }

    async fn send_once(&self, frame: &SendRequest) -> Result<(), SendError> {
        let mut script = self.inner.lock().unwrap();
        if script.failing_sends > 0 {
            script.failing_sends -= 1;
            return Err(SendError::Rejected);
        }
        script.sent.push(frame.clone());
        Ok(())
    }
}
