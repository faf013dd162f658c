//! In-memory event server.
//!
//! Keeps one append-only log and serves it three ways: `POST /events/poll`,
//! `POST /events/send`, and a WebSocket at `/events/ws` that streams new
//! entries for every subscribed scope. `GET /health` reports the log size.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use relink::core::{PollRequest, PollResponse, SendRequest, SendResponse, WireEvent};
use relink::ScopeKey;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::RelayError;

/// Capacity of the live fan-out channel.
const FANOUT_CAPACITY: usize = 256;

#[derive(Clone)]
struct Relay {
    log: Arc<RwLock<Vec<WireEvent>>>,
    live: broadcast::Sender<WireEvent>,
}

impl Relay {
    fn new() -> Self {
        let (live, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            log: Arc::new(RwLock::new(Vec::new())),
            live,
        }
    }

    /// Append a frame to the log, stamping it with a strictly increasing timestamp.
    async fn append(&self, frame: SendRequest) -> WireEvent {
        let scope = serde_json::from_value::<ScopeKey>(frame.data.clone()).ok();
        let mut log = self.log.write().await;
        let last = log.last().map_or(0, |e| e.timestamp);
        let event = WireEvent {
            event_type: frame.event_type,
            data: frame.data,
            timestamp: now_ms().max(last + 1),
            scope,
        };
        log.push(event.clone());
        let _ = self.live.send(event.clone());
        event
    }

    /// Entries for `scope` newer than `after`. Unscoped entries match every scope.
    async fn since(&self, scope: &ScopeKey, after: i64) -> Vec<WireEvent> {
        self.log
            .read()
            .await
            .iter()
            .filter(|e| e.timestamp > after && visible(e, scope))
            .cloned()
            .collect()
    }
}

fn visible(event: &WireEvent, scope: &ScopeKey) -> bool {
    event.scope.as_ref().is_none_or(|s| s == scope)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Serve until the process is stopped.
pub async fn run(bind: SocketAddr) -> Result<(), RelayError> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "relay server listening");
    axum::serve(listener, router(Relay::new())).await?;
    Ok(())
}

fn router(relay: Relay) -> Router {
    Router::new()
        .route("/events/poll", post(poll_handler))
        .route("/events/send", post(send_handler))
        .route("/events/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(relay)
}

async fn poll_handler(
    State(relay): State<Relay>,
    Json(request): Json<PollRequest>,
) -> Json<PollResponse> {
    let scope = request.scope();
    let events = relay.since(&scope, request.last_timestamp).await;
    debug!(%scope, after = request.last_timestamp, events = events.len(), "poll");
    Json(PollResponse { events })
}

async fn send_handler(
    State(relay): State<Relay>,
    Json(frame): Json<SendRequest>,
) -> Json<SendResponse> {
    if frame.is_control() {
        return Json(SendResponse { success: false });
    }
    let event = relay.append(frame).await;
    debug!(event_type = %event.event_type, timestamp = event.timestamp, "appended over http");
    Json(SendResponse { success: true })
}

async fn health_handler(State(relay): State<Relay>) -> impl IntoResponse {
    let entries = relay.log.read().await.len();
    Json(json!({ "healthy": true, "entries": entries }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Relay>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream(socket, relay))
}

/// Drive one push connection until either side goes away.
async fn stream(mut socket: WebSocket, relay: Relay) {
    let mut live = relay.live.subscribe();
    let mut scopes: HashSet<ScopeKey> = HashSet::new();
    info!("push client connected");

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else {
                    break;
                };
                let Message::Text(text) = message else {
                    continue;
                };
                let frame: SendRequest = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "malformed frame");
                        continue;
                    }
                };
                match frame.event_type.as_str() {
                    "subscribe" => {
                        let Ok(request) = serde_json::from_value::<PollRequest>(frame.data) else {
                            continue;
                        };
                        let scope = request.scope();
                        let backlog = relay.since(&scope, request.last_timestamp).await;
                        debug!(%scope, replay = backlog.len(), "subscribe");
                        for event in backlog {
                            if !send(&mut socket, event.with_scope(scope.clone())).await {
                                return;
                            }
                        }
                        scopes.insert(scope);
                    }
                    "unsubscribe" => {
                        if let Ok(scope) = serde_json::from_value::<ScopeKey>(frame.data) {
                            scopes.remove(&scope);
                        }
                    }
                    _ => {
                        relay.append(frame).await;
                    }
                }
            }
            entry = live.recv() => {
                let event = match entry {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push client lagging");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                for scope in scopes.iter().filter(|s| visible(&event, s)) {
                    if !send(&mut socket, event.clone().with_scope(scope.clone())).await {
                        return;
                    }
                }
            }
        }
    }

    info!("push client disconnected");
}

async fn send(socket: &mut WebSocket, event: WireEvent) -> bool {
    match serde_json::to_string(&event) {
        Ok(payload) => socket.send(Message::Text(payload.into())).await.is_ok(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_is_strictly_increasing() {
        let relay = Relay::new();
        let scope = ScopeKey::new("demo", "lobby", "general");
        let frame = SendRequest {
            event_type: "chat:send".into(),
            data: serde_json::to_value(&scope).unwrap(),
        };
        let first = relay.append(frame.clone()).await;
        let second = relay.append(frame).await;
        assert!(second.timestamp > first.timestamp);
        assert_eq!(first.scope.as_ref(), Some(&scope));

        let newer = relay.since(&scope, first.timestamp).await;
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].timestamp, second.timestamp);

        let other = ScopeKey::new("demo", "lobby", "random");
        assert!(relay.since(&other, 0).await.is_empty());
    }
}
