//! The connection manager.
//!
//! [`ConnectionManager`] is a cheap handle; all state lives in one task
//! spawned by [`ConnectionManager::new`]. That task owns the state machine,
//! the cursors, the outbound queue and the timers, and is the only place any
//! of them change. Every push attempt and every polling session is stamped
//! with a fresh epoch; completions and push signals carrying an epoch that is
//! no longer current are discarded, so a superseded transport can never touch
//! state after teardown.
//!
//! ```text
//!                 connect()
//! DISCONNECTED ─────────────▶ CONNECTING ──ok──▶ CONNECTED_PUSH
//!      ▲                       │    ▲                 │
//!      │ budget spent          │    │ backoff timer   │ lost
//!      │ (push only)     fail  ▼    │                 ▼
//!      └──────────────── RECONNECTING ◀───────────────┘
//!                              │
//!                              │ maxConnectionAttempts reached
//!                              ▼
//!                       CONNECTED_POLL ──probe ok──▶ CONNECTED_PUSH
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::config::ManagerConfig;
use super::handlers::{ErrorHandler, EventHandler, HandlerId, HandlerRegistry};
use super::status::{ConnectionState, ConnectionStatus};
use crate::core::{
    ConnectionError, ErrorKind, InboundEvent, LinkError, OutboundMessage, PollRequest,
    PollResponse, PollTransport, PollingError, PushSignal, PushSink, PushTransport, QueueOverflow,
    ScopeKey, SendError, SendRequest, WireEvent,
};
use crate::transport::{
    BackoffPolicy, BackoffState, EventCursor, FlushReport, OutboundQueue, PollSchedule,
    flush_batch,
};

/// Transport-agnostic real-time connection.
///
/// Starts on a push transport, degrades to polling after repeated push
/// failures, and probes push again while degraded. Subscribers see one
/// ordered, duplicate-free event stream per scope regardless of transport.
///
/// Every method only enqueues a command for the manager task and returns
/// immediately; status changes become visible once the task has processed
/// the command.
///
/// # Example
///
/// ```no_run
/// use relink::prelude::*;
/// use serde_json::json;
///
/// # async fn demo() -> Result<(), LinkError> {
/// let base = url::Url::parse("http://localhost:8080/").expect("valid url");
/// let manager = ConnectionManager::new(
///     ManagerConfig::default(),
///     WebSocketPush::new("ws://localhost:8080/events/ws"),
///     HttpPolling::new(base)?,
/// )?;
///
/// manager.on("message:new", |event| println!("{}: {}", event.timestamp, event.data));
/// let scope = ScopeKey::new("u1", "s1", "general");
/// manager.connect(scope.clone())?;
/// manager.emit(scope, "chat:send", json!({ "text": "hello" }))?;
///
/// println!("{:?}", manager.get_connection_status());
/// manager.dispose().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    next_handler_id: AtomicU64,
    task: Option<JoinHandle<()>>,
}

enum Command {
    Connect(ScopeKey),
    Disconnect(Option<ScopeKey>),
    Emit(OutboundMessage),
    On {
        id: HandlerId,
        event_type: String,
        handler: EventHandler,
    },
    Off {
        id: HandlerId,
        event_type: String,
    },
    OnError {
        id: HandlerId,
        handler: ErrorHandler,
    },
    OffError(HandlerId),
    Shutdown(Option<oneshot::Sender<()>>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(scope) => f.debug_tuple("Connect").field(scope).finish(),
            Self::Disconnect(scope) => f.debug_tuple("Disconnect").field(scope).finish(),
            Self::Emit(message) => f.debug_tuple("Emit").field(&message.event_type).finish(),
            Self::On { id, event_type, .. } => {
                f.debug_struct("On").field("id", id).field("event_type", event_type).finish()
            }
            Self::Off { id, event_type } => {
                f.debug_struct("Off").field("id", id).field("event_type", event_type).finish()
            }
            Self::OnError { id, .. } => f.debug_struct("OnError").field("id", id).finish(),
            Self::OffError(id) => f.debug_tuple("OffError").field(id).finish(),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl ConnectionManager {
    /// Create a manager and start its task on the current tokio runtime.
    ///
    /// The manager starts `DISCONNECTED`; nothing is opened until
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] for an invalid configuration and
    /// [`LinkError::NoRuntime`] when called outside a tokio runtime.
    pub fn new<P, Q>(config: ManagerConfig, push: P, poll: Q) -> Result<Self, LinkError>
    where
        P: PushTransport,
        Q: PollTransport,
    {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| LinkError::NoRuntime)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(config, Arc::new(push), Arc::new(poll), status_tx, signal_tx);
        let task = runtime.spawn(driver.run(command_rx, signal_rx));

        Ok(Self {
            commands,
            status,
            next_handler_id: AtomicU64::new(1),
            task: Some(task),
        })
    }

    /// Subscribe to `scope`, connecting if disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] once the manager is disposed.
    pub fn connect(&self, scope: ScopeKey) -> Result<(), LinkError> {
        self.send(Command::Connect(scope))
    }

    /// Unsubscribe from `scope`, or tear everything down with `None`.
    ///
    /// Unsubscribing the last scope disconnects. Queued outbound messages
    /// survive a disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] once the manager is disposed.
    pub fn disconnect(&self, scope: Option<ScopeKey>) -> Result<(), LinkError> {
        self.send(Command::Disconnect(scope))
    }

    /// Queue an outbound message for `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] once the manager is disposed.
    pub fn emit(
        &self,
        scope: ScopeKey,
        event_type: impl Into<String>,
        data: Value,
    ) -> Result<(), LinkError> {
        self.send(Command::Emit(OutboundMessage::new(scope, event_type, data)))
    }

    /// Queue an outbound message that overflow eviction skips while any
    /// non-critical message is queued.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] once the manager is disposed.
    pub fn emit_critical(
        &self,
        scope: ScopeKey,
        event_type: impl Into<String>,
        data: Value,
    ) -> Result<(), LinkError> {
        let message = OutboundMessage::new(scope, event_type, data).critical();
        self.send(Command::Emit(message))
    }

    /// Register `handler` for `event_type` (`"*"` receives every event).
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let _ = self.send(Command::On {
            id,
            event_type: event_type.into(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Unregister an event handler.
    pub fn off(&self, event_type: impl Into<String>, id: HandlerId) {
        let _ = self.send(Command::Off {
            id,
            event_type: event_type.into(),
        });
    }

    /// Register a handler for errors surfaced to the caller: the terminal
    /// connection error, queue overflows and dropped messages.
    pub fn on_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&LinkError) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let _ = self.send(Command::OnError {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Unregister an error handler.
    pub fn off_error(&self, id: HandlerId) {
        let _ = self.send(Command::OffError(id));
    }

    /// Current status snapshot.
    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Tear everything down and wait for the manager task to finish.
    pub async fn dispose(mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), LinkError> {
        self.commands.send(command).map_err(|_| LinkError::Closed)
    }

    fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Command::Shutdown(None));
        }
    }
}

/// Outcome of a piece of I/O the manager task started.
enum Completion {
    PushOpened {
        epoch: u64,
        result: Result<(), ConnectionError>,
    },
    Polled {
        epoch: u64,
        scope: ScopeKey,
        result: Result<PollResponse, PollingError>,
    },
    Flushed {
        epoch: Option<u64>,
        report: FlushReport,
    },
    Control {
        frame_type: String,
        result: Result<(), SendError>,
    },
    Closed,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// State owned by the manager task.
struct Driver<P, Q> {
    config: ManagerConfig,
    policy: BackoffPolicy,
    push: Arc<P>,
    poll: Arc<Q>,
    status: watch::Sender<ConnectionStatus>,
    signal_tx: mpsc::UnboundedSender<(u64, PushSignal)>,

    handlers: HandlerRegistry,
    cursor: EventCursor,
    queue: OutboundQueue,
    schedule: PollSchedule,
    backoff: BackoffState,

    state: ConnectionState,
    use_polling: bool,
    /// Consecutive failed push attempts, probes included.
    failed_attempts: u32,
    /// Failed upgrade probes since falling back.
    probe_failures: u32,
    last_error: Option<ErrorKind>,

    next_epoch: u64,
    push_epoch: Option<u64>,
    poll_epoch: Option<u64>,
    /// Events from the current attempt that arrived before its open resolved.
    pending_push: Vec<WireEvent>,

    retry_at: Option<Instant>,
    upgrade_at: Option<Instant>,
    flush_retry_at: Option<Instant>,
    flushing: bool,

    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl<P, Q> Driver<P, Q>
where
    P: PushTransport,
    Q: PollTransport,
{
    fn new(
        config: ManagerConfig,
        push: Arc<P>,
        poll: Arc<Q>,
        status: watch::Sender<ConnectionStatus>,
        signal_tx: mpsc::UnboundedSender<(u64, PushSignal)>,
    ) -> Self {
        Self {
            policy: config.backoff_policy(),
            queue: OutboundQueue::new(config.queue_capacity),
            config,
            push,
            poll,
            status,
            signal_tx,
            handlers: HandlerRegistry::new(),
            cursor: EventCursor::new(),
            schedule: PollSchedule::new(),
            backoff: BackoffState::default(),
            state: ConnectionState::Disconnected,
            use_polling: false,
            failed_attempts: 0,
            probe_failures: 0,
            last_error: None,
            next_epoch: 0,
            push_epoch: None,
            poll_epoch: None,
            pending_push: Vec::new(),
            retry_at: None,
            upgrade_at: None,
            flush_retry_at: None,
            flushing: false,
            in_flight: FuturesUnordered::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<(u64, PushSignal)>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown().await;
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        return;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some((epoch, signal)) = signals.recv() => self.on_signal(epoch, signal),
                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_completion(completion);
                }
                () = sleep_until(deadline) => self.on_timer(),
            }
            self.publish_status();
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        trace!(?command, "command");
        match command {
            Command::Connect(scope) => self.connect(scope),
            Command::Disconnect(Some(scope)) => self.unsubscribe(scope),
            Command::Disconnect(None) => self.disconnect_all(),
            Command::Emit(message) => self.emit(message),
            Command::On {
                id,
                event_type,
                handler,
            } => self.handlers.on(id, event_type, handler),
            Command::Off { id, event_type } => {
                self.handlers.off(&event_type, id);
            }
            Command::OnError { id, handler } => self.handlers.on_error(id, handler),
            Command::OffError(id) => {
                self.handlers.off_error(id);
            }
            Command::Shutdown(_) => {}
        }
    }

    fn connect(&mut self, scope: ScopeKey) {
        let added = self.cursor.track(scope.clone());

        match self.state {
            ConnectionState::Disconnected => {
                info!(%scope, "connecting");
                self.backoff.reset();
                self.failed_attempts = 0;
                self.probe_failures = 0;
                self.use_polling = false;
                self.last_error = None;
                self.state = ConnectionState::Connecting;
                self.begin_push_attempt();
            }
            ConnectionState::ConnectedPush if added => {
                let request = PollRequest::new(&scope, self.cursor.get(&scope));
                self.send_control(SendRequest::subscribe(&request));
            }
            ConnectionState::ConnectedPoll if added => {
                self.schedule
                    .start(scope, self.config.polling_rate, Instant::now());
            }
            _ => debug!(%scope, state = %self.state, "scope joins the current session"),
        }
    }

    fn unsubscribe(&mut self, scope: ScopeKey) {
        if self.cursor.forget(&scope).is_none() {
            debug!(%scope, "unsubscribe for unknown scope");
            return;
        }
        info!(%scope, "unsubscribed");
        self.schedule.stop(&scope);
        if self.state == ConnectionState::ConnectedPush {
            self.send_control(SendRequest::unsubscribe(&scope));
        }
        if self.cursor.is_empty() {
            self.disconnect_all();
        }
    }

    fn disconnect_all(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        info!(state = %self.state, "disconnecting");
        if self.teardown() {
            let push = Arc::clone(&self.push);
            self.in_flight.push(
                async move {
                    push.close().await;
                    Completion::Closed
                }
                .boxed(),
            );
        }
        self.state = ConnectionState::Disconnected;
        self.use_polling = false;
        self.backoff.reset();
    }

    fn emit(&mut self, message: OutboundMessage) {
        debug!(
            scope = %message.scope,
            event_type = %message.event_type,
            queued = self.queue.len(),
            "emit"
        );
        if let Some(overflow) = self.queue.enqueue(message) {
            self.report_overflow(overflow);
        }
        self.flush();
    }

    async fn shutdown(&mut self) {
        debug!("manager shutting down");
        self.teardown();
        self.state = ConnectionState::Disconnected;
        self.use_polling = false;
        self.publish_status();
        self.push.close().await;
    }

    /// Cancel every timer and detach both transports. Returns whether a push
    /// connection or attempt was live.
    fn teardown(&mut self) -> bool {
        let push_live = self.push_epoch.take().is_some();
        self.stop_polling();
        self.pending_push.clear();
        self.retry_at = None;
        self.upgrade_at = None;
        self.flush_retry_at = None;
        push_live
    }

    // =========================================================================
    // Push
    // =========================================================================

    fn begin_push_attempt(&mut self) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.push_epoch = Some(epoch);
        self.pending_push.clear();

        debug!(epoch, attempt = self.backoff.attempt, "opening push transport");
        let sink = PushSink::new(epoch, self.signal_tx.clone());
        let push = Arc::clone(&self.push);
        self.in_flight.push(
            async move {
                let result = push.open(sink).await;
                Completion::PushOpened { epoch, result }
            }
            .boxed(),
        );
    }

    fn on_push_opened(&mut self, epoch: u64, result: Result<(), ConnectionError>) {
        if self.push_epoch != Some(epoch) {
            trace!(epoch, "stale push open result");
            if result.is_ok() && self.push_epoch.is_none() {
                let push = Arc::clone(&self.push);
                self.in_flight.push(
                    async move {
                        push.close().await;
                        Completion::Closed
                    }
                    .boxed(),
                );
            }
            return;
        }

        match result {
            Ok(()) => self.on_push_connected(),
            Err(error) => self.on_push_failed(error),
        }
    }

    fn on_push_connected(&mut self) {
        if self.state == ConnectionState::ConnectedPoll {
            info!(probes = self.probe_failures, "upgraded from polling to push");
            self.stop_polling();
        } else {
            info!(attempts = self.failed_attempts, "push connected");
        }

        self.state = ConnectionState::ConnectedPush;
        self.backoff.reset();
        self.failed_attempts = 0;
        self.probe_failures = 0;
        self.use_polling = false;
        self.last_error = None;
        self.retry_at = None;
        self.upgrade_at = None;

        let mut scopes: Vec<ScopeKey> = self.cursor.scopes().cloned().collect();
        scopes.sort();
        for scope in scopes {
            let request = PollRequest::new(&scope, self.cursor.get(&scope));
            self.send_control(SendRequest::subscribe(&request));
        }

        for event in std::mem::take(&mut self.pending_push) {
            self.accept_push_event(event);
        }

        self.publish_status();
        self.flush();
    }

    fn on_push_failed(&mut self, error: ConnectionError) {
        self.push_epoch = None;
        self.pending_push.clear();

        let delay = self.backoff.fail(&self.policy);
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.last_error = Some(ErrorKind::Connection(error.reason));
        warn!(
            attempt = self.failed_attempts,
            reason = %error.reason,
            error = %error.message,
            state = %self.state,
            "push attempt failed"
        );

        if self.state == ConnectionState::ConnectedPoll {
            self.probe_failures += 1;
            if self.probe_failures >= self.config.max_reconnect_attempts {
                warn!(probes = self.probe_failures, "giving up on upgrading to push");
                self.upgrade_at = None;
            } else {
                self.upgrade_at = Some(Instant::now() + self.config.upgrade_interval);
            }
        } else if self.config.fallback_enabled()
            && self.backoff.attempt >= self.config.max_connection_attempts
        {
            self.fall_back_to_polling();
        } else if !self.config.fallback_enabled()
            && self.backoff.attempt >= self.config.max_reconnect_attempts
        {
            self.give_up(error);
        } else {
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            self.state = ConnectionState::Reconnecting;
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    fn give_up(&mut self, error: ConnectionError) {
        error!(
            attempts = self.failed_attempts,
            error = %error,
            "push connection attempts exhausted; session ended"
        );
        self.teardown();
        self.state = ConnectionState::Disconnected;
        self.backoff.reset();
        self.publish_status();
        self.handlers.report(&LinkError::Connection(error));
    }

    fn on_signal(&mut self, epoch: u64, signal: PushSignal) {
        if self.push_epoch != Some(epoch) {
            trace!(epoch, "stale push signal");
            return;
        }
        match signal {
            PushSignal::Event(event) if self.state == ConnectionState::ConnectedPush => {
                self.accept_push_event(event);
            }
            PushSignal::Event(event) => self.pending_push.push(event),
            PushSignal::Closed(error) => {
                if self.state == ConnectionState::ConnectedPush {
                    warn!(reason = %error.reason, "push connection lost");
                }
                self.on_push_failed(error);
            }
        }
    }

    fn accept_push_event(&mut self, event: WireEvent) {
        let scope = match (&event.scope, self.cursor.sole_scope()) {
            (Some(scope), _) => scope.clone(),
            (None, Some(scope)) => scope.clone(),
            (None, None) => {
                warn!(event_type = %event.event_type, "dropping unscoped push event");
                return;
            }
        };
        self.deliver(&scope, vec![event]);
    }

    fn send_control(&mut self, frame: SendRequest) {
        let push = Arc::clone(&self.push);
        self.in_flight.push(
            async move {
                let result = push.send(&frame).await;
                Completion::Control {
                    frame_type: frame.event_type,
                    result,
                }
            }
            .boxed(),
        );
    }

    // =========================================================================
    // Polling
    // =========================================================================

    fn fall_back_to_polling(&mut self) {
        info!(attempts = self.failed_attempts, "falling back to polling");
        self.retry_at = None;
        self.state = ConnectionState::ConnectedPoll;
        self.use_polling = true;
        self.backoff.reset();
        self.probe_failures = 0;

        self.next_epoch += 1;
        self.poll_epoch = Some(self.next_epoch);
        let now = Instant::now();
        for scope in self.cursor.scopes() {
            self.schedule
                .start(scope.clone(), self.config.polling_rate, now);
        }

        self.upgrade_at =
            (self.config.max_reconnect_attempts > 0).then(|| now + self.config.upgrade_interval);

        self.publish_status();
        self.flush();
    }

    fn stop_polling(&mut self) {
        self.poll_epoch = None;
        self.schedule.stop_all();
    }

    fn dispatch_polls(&mut self, now: Instant) {
        let Some(epoch) = self.poll_epoch else {
            return;
        };
        for scope in self.schedule.take_due(now) {
            let request = PollRequest::new(&scope, self.cursor.get(&scope));
            trace!(%scope, last_timestamp = request.last_timestamp, "poll cycle");
            let poll = Arc::clone(&self.poll);
            self.in_flight.push(
                async move {
                    let result = poll.poll(&request).await;
                    Completion::Polled {
                        epoch,
                        scope,
                        result,
                    }
                }
                .boxed(),
            );
        }
    }

    fn on_polled(
        &mut self,
        epoch: u64,
        scope: ScopeKey,
        result: Result<PollResponse, PollingError>,
    ) {
        if self.poll_epoch != Some(epoch) {
            trace!(epoch, %scope, "stale poll result");
            return;
        }
        self.schedule.complete(&scope);

        match result {
            Ok(response) => {
                if self.last_error == Some(ErrorKind::Polling) {
                    self.last_error = None;
                }
                self.deliver(&scope, response.events);
            }
            Err(error) => {
                warn!(%scope, error = %error, "poll cycle failed");
                self.last_error = Some(ErrorKind::Polling);
            }
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn deliver(&mut self, scope: &ScopeKey, batch: Vec<WireEvent>) {
        let received = batch.len();
        let events = self.cursor.admit(scope, batch);
        if received > events.len() {
            debug!(%scope, dropped = received - events.len(), "filtered already-seen events");
        }
        for event in &events {
            trace!(%scope, event_type = %event.event_type, timestamp = event.timestamp, "deliver");
            self.handlers.dispatch(event);
        }
    }

    fn flush(&mut self) {
        if self.flushing || self.queue.is_empty() {
            return;
        }

        let batch = match self.state {
            ConnectionState::ConnectedPush | ConnectionState::ConnectedPoll => {
                self.queue.take_batch()
            }
            _ => return,
        };
        self.flushing = true;
        self.flush_retry_at = None;
        let epoch = self.transport_epoch();
        debug!(messages = batch.len(), state = %self.state, ?epoch, "flushing outbound queue");

        let flush = if self.state == ConnectionState::ConnectedPush {
            let push = Arc::clone(&self.push);
            async move {
                let report = flush_batch(batch, |frame| {
                    let push = Arc::clone(&push);
                    async move { push.send(&frame).await }
                })
                .await;
                Completion::Flushed { epoch, report }
            }
            .boxed()
        } else {
            let poll = Arc::clone(&self.poll);
            async move {
                let report = flush_batch(batch, |frame| {
                    let poll = Arc::clone(&poll);
                    async move { poll.send_once(&frame).await }
                })
                .await;
                Completion::Flushed { epoch, report }
            }
            .boxed()
        };
        self.in_flight.push(flush);
    }

    /// Epoch of the transport a flush would go out on.
    fn transport_epoch(&self) -> Option<u64> {
        match self.state {
            ConnectionState::ConnectedPush => self.push_epoch,
            ConnectionState::ConnectedPoll => self.poll_epoch,
            _ => None,
        }
    }

    fn on_flushed(&mut self, epoch: Option<u64>, report: FlushReport) {
        self.flushing = false;
        let FlushReport {
            sent,
            failed,
            mut remainder,
        } = report;

        // A failure on a transport that has since been torn down says nothing
        // about the message; requeue it untouched for the next transport.
        if epoch.is_none() || epoch != self.transport_epoch() {
            if let Some((message, error)) = failed {
                debug!(
                    sent,
                    ?epoch,
                    event_type = %message.event_type,
                    error = %error,
                    "stale flush result; requeueing"
                );
                remainder.insert(0, message);
                for overflow in self.queue.restore(remainder) {
                    self.report_overflow(overflow);
                }
            }
            self.flush();
            return;
        }

        let Some((mut message, error)) = failed else {
            debug!(sent, "outbound queue flushed");
            if self.last_error == Some(ErrorKind::Send) {
                self.last_error = None;
            }
            self.flush();
            return;
        };

        message.attempts += 1;
        self.last_error = Some(ErrorKind::Send);
        warn!(
            sent,
            event_type = %message.event_type,
            attempts = message.attempts,
            error = %error,
            "send failed"
        );

        if message.attempts >= self.config.max_send_attempts {
            warn!(event_type = %message.event_type, "dropping message after repeated send failures");
            self.publish_status();
            self.handlers.report(&LinkError::Send(error));
        } else {
            remainder.insert(0, message);
        }

        for overflow in self.queue.restore(remainder) {
            self.report_overflow(overflow);
        }
        self.flush_retry_at = Some(Instant::now() + self.config.polling_rate);
    }

    fn report_overflow(&mut self, overflow: QueueOverflow) {
        warn!(
            capacity = overflow.capacity,
            dropped = %overflow.dropped.event_type,
            scope = %overflow.dropped.scope,
            "outbound queue overflow"
        );
        self.last_error = Some(ErrorKind::QueueOverflow);
        self.publish_status();
        self.handlers.report(&LinkError::QueueOverflow(overflow));
    }

    // =========================================================================
    // Timers and completions
    // =========================================================================

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.retry_at,
            self.upgrade_at,
            self.flush_retry_at,
            self.schedule.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_timer(&mut self) {
        let now = Instant::now();

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            if self.state == ConnectionState::Reconnecting {
                self.state = ConnectionState::Connecting;
                self.begin_push_attempt();
            }
        }

        if self.upgrade_at.is_some_and(|at| at <= now) {
            self.upgrade_at = None;
            if self.state == ConnectionState::ConnectedPoll && self.push_epoch.is_none() {
                info!(probe = self.probe_failures + 1, "probing push transport");
                self.begin_push_attempt();
            }
        }

        if self.flush_retry_at.is_some_and(|at| at <= now) {
            self.flush_retry_at = None;
            self.flush();
        }

        self.dispatch_polls(now);
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::PushOpened { epoch, result } => self.on_push_opened(epoch, result),
            Completion::Polled {
                epoch,
                scope,
                result,
            } => self.on_polled(epoch, scope, result),
            Completion::Flushed { epoch, report } => self.on_flushed(epoch, report),
            Completion::Control { frame_type, result } => {
                if let Err(error) = result {
                    warn!(frame = %frame_type, error = %error, "control frame not sent");
                }
            }
            Completion::Closed => trace!("push transport closed"),
        }
    }

    fn publish_status(&self) {
        let status = ConnectionStatus::compute(
            self.state,
            self.use_polling,
            self.failed_attempts,
            self.last_error,
        );
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
