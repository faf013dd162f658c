//! The reqwest and tokio-tungstenite transports against in-process servers.

#![cfg(all(feature = "http", feature = "websocket"))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use relink::core::{
    ConnectionFailure, PollRequest, PollResponse, PollTransport, PollingError, PushSignal,
    PushSink, PushTransport, SendError, SendRequest, SendResponse, WireEvent,
};
use relink::prelude::{
    ConnectionManager, ConnectionState, HttpPolling, ManagerConfig, ScopeKey, WebSocketPush,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

fn scope() -> ScopeKey {
    ScopeKey::new("u1", "s1", "general")
}

#[derive(Clone)]
struct Backend {
    events: Arc<Vec<WireEvent>>,
    sent: mpsc::UnboundedSender<SendRequest>,
}

async fn poll_events(
    State(backend): State<Backend>,
    Json(request): Json<PollRequest>,
) -> Json<PollResponse> {
    let events = backend
        .events
        .iter()
        .filter(|e| e.timestamp > request.last_timestamp)
        .cloned()
        .collect();
    Json(PollResponse { events })
}

async fn send_event(
    State(backend): State<Backend>,
    Json(frame): Json<SendRequest>,
) -> Json<SendResponse> {
    let success = frame.event_type != "chat:reject";
    let _ = backend.sent.send(frame);
    Json(SendResponse { success })
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn backend(prefix: &str) -> (SocketAddr, mpsc::UnboundedReceiver<SendRequest>) {
    let (sent, sent_rx) = mpsc::unbounded_channel();
    let state = Backend {
        events: Arc::new(vec![
            WireEvent::new("message:new", json!({ "id": "m1" }), 100),
            WireEvent::new("message:new", json!({ "id": "m2" }), 200),
            WireEvent::new("message:new", json!({ "id": "m3" }), 300),
        ]),
        sent,
    };
    let routes = Router::new()
        .route("/events/poll", post(poll_events))
        .route("/events/send", post(send_event))
        .with_state(state);
    let router = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    };
    (serve(router).await, sent_rx)
}

/// An address nothing listens on.
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// =============================================================================
// HTTP polling
// =============================================================================

#[tokio::test]
async fn test_http_poll_returns_newer_events() {
    let (addr, _sent) = backend("").await;
    let http = HttpPolling::new(Url::parse(&format!("http://{addr}")).unwrap()).unwrap();

    let response = http.poll(&PollRequest::new(&scope(), 100)).await.unwrap();
    let timestamps: Vec<i64> = response.events.iter().map(|e| e.timestamp).collect();
    assert_eq!(timestamps, vec![200, 300]);
    assert_eq!(response.events[0].data["id"], "m2");
}

#[tokio::test]
async fn test_http_endpoints_keep_base_path() {
    let (addr, mut sent) = backend("/api").await;
    let http = HttpPolling::new(Url::parse(&format!("http://{addr}/api")).unwrap()).unwrap();
    assert_eq!(http.poll_url().path(), "/api/events/poll");

    let response = http.poll(&PollRequest::new(&scope(), 0)).await.unwrap();
    assert_eq!(response.events.len(), 3);

    let frame = SendRequest {
        event_type: "chat:send".into(),
        data: json!({ "text": "hi" }),
    };
    http.send_once(&frame).await.unwrap();
    assert_eq!(sent.recv().await.unwrap(), frame);
}

#[tokio::test]
async fn test_http_send_rejected() {
    let (addr, _sent) = backend("").await;
    let http = HttpPolling::new(Url::parse(&format!("http://{addr}")).unwrap()).unwrap();

    let frame = SendRequest {
        event_type: "chat:reject".into(),
        data: json!({}),
    };
    assert_eq!(http.send_once(&frame).await, Err(SendError::Rejected));
}

#[tokio::test]
async fn test_http_poll_errors() {
    let router = Router::new()
        .route("/down/events/poll", post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/garbled/events/poll", post(|| async { "not json" }));
    let addr = serve(router).await;

    let down = HttpPolling::new(Url::parse(&format!("http://{addr}/down/")).unwrap()).unwrap();
    assert_eq!(
        down.poll(&PollRequest::new(&scope(), 0)).await,
        Err(PollingError::Status { status: 503 })
    );

    let garbled =
        HttpPolling::new(Url::parse(&format!("http://{addr}/garbled/")).unwrap()).unwrap();
    assert!(matches!(
        garbled.poll(&PollRequest::new(&scope(), 0)).await,
        Err(PollingError::Decode(_))
    ));

    let unreachable =
        HttpPolling::new(Url::parse(&format!("http://{}", closed_port().await)).unwrap()).unwrap();
    assert!(matches!(
        unreachable.poll(&PollRequest::new(&scope(), 0)).await,
        Err(PollingError::Request(_))
    ));
}

// =============================================================================
// WebSocket push
// =============================================================================

#[tokio::test]
async fn test_websocket_subscribe_and_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames) = mpsc::unbounded_channel::<SendRequest>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let frame: SendRequest = serde_json::from_str(text.as_str()).unwrap();
            let subscribed = frame.event_type == "subscribe";
            frames_tx.send(frame).unwrap();
            if subscribed {
                let event = WireEvent::new("message:new", json!({ "id": "m4" }), 400);
                let payload = serde_json::to_string(&event).unwrap();
                ws.send(Message::Text(payload.into())).await.unwrap();
                ws.send(Message::Text("{ not an event".into())).await.unwrap();
                ws.close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "restarting".into(),
                }))
                .await
                .unwrap();
                break;
            }
        }
    });

    let push = WebSocketPush::new(format!("ws://{addr}/events/ws"));
    let (sink, mut signals) = PushSink::channel(3);
    push.open(sink).await.unwrap();

    push.send(&SendRequest::subscribe(&PollRequest::new(&scope(), 300)))
        .await
        .unwrap();
    let frame = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(frame.event_type, "subscribe");
    assert_eq!(frame.data["lastTimestamp"], 300);

    let (epoch, signal) = timeout(WAIT, signals.recv()).await.unwrap().unwrap();
    assert_eq!(epoch, 3);
    match signal {
        PushSignal::Event(event) => {
            assert_eq!(event.timestamp, 400);
            assert_eq!(event.data["id"], "m4");
        }
        other => panic!("expected an event, got {other:?}"),
    }

    // the malformed frame is skipped; the close frame ends the connection
    let (_, signal) = timeout(WAIT, signals.recv()).await.unwrap().unwrap();
    match signal {
        PushSignal::Closed(error) => assert_eq!(error.reason, ConnectionFailure::Refused),
        other => panic!("expected a close, got {other:?}"),
    }

    push.close().await;
}

#[tokio::test]
async fn test_websocket_refused() {
    let push = WebSocketPush::new(format!("ws://{}/events/ws", closed_port().await));
    let (sink, _signals) = PushSink::channel(1);

    let error = push.open(sink).await.unwrap_err();
    assert_eq!(error.reason, ConnectionFailure::Refused);
    assert_eq!(
        push.send(&SendRequest::subscribe(&PollRequest::new(&scope(), 0)))
            .await,
        Err(SendError::NotConnected)
    );
}

#[tokio::test]
async fn test_close_does_not_wait_for_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (release_tx, release) = tokio::sync::oneshot::channel::<()>();

    // accept the TCP connection but never answer the upgrade request
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = release.await;
        drop(stream);
    });

    let push = Arc::new(
        WebSocketPush::new(format!("ws://{addr}/events/ws"))
            .with_connect_timeout(Duration::from_secs(30)),
    );
    let (sink, _signals) = PushSink::channel(1);
    let opening = tokio::spawn({
        let push = Arc::clone(&push);
        async move { push.open(sink).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!opening.is_finished());

    let frame = SendRequest {
        event_type: "chat:send".into(),
        data: json!({}),
    };
    assert_eq!(
        timeout(Duration::from_millis(500), push.send(&frame)).await.unwrap(),
        Err(SendError::NotConnected)
    );
    timeout(Duration::from_millis(500), push.close()).await.unwrap();

    let _ = release_tx.send(());
    let result = timeout(WAIT, opening).await.unwrap().unwrap();
    assert!(result.is_err());
    assert_eq!(push.send(&frame).await, Err(SendError::NotConnected));
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test]
async fn test_manager_falls_back_to_http() {
    let (addr, mut sent) = backend("").await;
    let config = ManagerConfig::builder()
        .max_connection_attempts(1)
        .polling_rate(Duration::from_millis(20))
        .build();
    let manager = ConnectionManager::new(
        config,
        WebSocketPush::new(format!("ws://{}/events/ws", closed_port().await)),
        HttpPolling::new(Url::parse(&format!("http://{addr}")).unwrap()).unwrap(),
    )
    .unwrap();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    manager.on("message:new", move |event| {
        let _ = events_tx.send(event.timestamp);
    });
    manager.connect(scope()).unwrap();

    let mut status = manager.watch_status();
    timeout(WAIT, status.wait_for(|s| s.state == ConnectionState::ConnectedPoll))
        .await
        .unwrap()
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(timeout(WAIT, events.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, vec![100, 200, 300]);

    manager
        .emit(scope(), "chat:send", json!({ "text": "over http" }))
        .unwrap();
    let frame = timeout(WAIT, sent.recv()).await.unwrap().unwrap();
    assert_eq!(frame.data["text"], "over http");

    // later cycles resume from the cursor and deliver nothing twice
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());

    manager.dispose().await;
}
