//! WebSocket push transport.
//!
//! One socket at a time. `open` performs the handshake and spawns a reader
//! task that forwards inbound envelopes to the sink; the writer half stays
//! behind a mutex for `send`. The mutex is never held across the handshake,
//! so `close` and `send` return promptly while an open is pending; a `close`
//! issued meanwhile cancels that open once its handshake resolves.

use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::core::constants::DEFAULT_CONNECT_TIMEOUT;
use crate::core::{
    ConnectionError, ConnectionFailure, PushSink, PushTransport, SendError, SendRequest, WireEvent,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct LiveSocket {
    writer: SplitSink<Socket, Message>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    socket: Option<LiveSocket>,
    /// Bumped by every `close`.
    generation: u64,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.socket.as_ref().is_some_and(|s| !s.reader.is_finished())
    }
}

/// [`PushTransport`] over tokio-tungstenite.
pub struct WebSocketPush {
    url: String,
    connect_timeout: Duration,
    live: Mutex<Slot>,
}

impl std::fmt::Debug for WebSocketPush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketPush")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl WebSocketPush {
    /// Create a transport for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            live: Mutex::new(Slot::default()),
        }
    }

    /// Set the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PushTransport for WebSocketPush {
    async fn open(&self, sink: PushSink) -> Result<(), ConnectionError> {
        let generation = {
            let slot = self.live.lock().await;
            if slot.is_live() {
                debug!(url = %self.url, "push transport already open");
                return Ok(());
            }
            slot.generation
        };

        debug!(url = %self.url, epoch = sink.epoch(), "opening push connection");
        let handshake = connect_async(self.url.as_str());
        let (mut stream, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ConnectionError::timeout(format!(
                    "no handshake within {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(classify)?;

        let mut slot = self.live.lock().await;
        if slot.generation != generation || slot.is_live() {
            let cancelled = slot.generation != generation;
            drop(slot);
            if let Err(e) = stream.close(None).await {
                debug!(error = %e, "discarding push socket");
            }
            if cancelled {
                return Err(ConnectionError::refused("closed during handshake"));
            }
            debug!(url = %self.url, "push transport opened concurrently");
            return Ok(());
        }

        let (writer, reader) = stream.split();
        let reader = tokio::spawn(read_loop(reader, sink));
        if let Some(stale) = slot.socket.replace(LiveSocket { writer, reader }) {
            stale.reader.abort();
        }

        info!(url = %self.url, "push connection open");
        Ok(())
    }

    async fn close(&self) {
        let taken = {
            let mut slot = self.live.lock().await;
            slot.generation += 1;
            slot.socket.take()
        };
        let Some(mut socket) = taken else {
            return;
        };
        socket.reader.abort();
        if let Err(e) = socket.writer.close().await {
            debug!(error = %e, "closing push socket");
        }
        debug!(url = %self.url, "push connection closed");
    }

    async fn send(&self, frame: &SendRequest) -> Result<(), SendError> {
        let payload = serde_json::to_string(frame).map_err(|e| SendError::Encode(e.to_string()))?;

        let mut slot = self.live.lock().await;
        let socket = slot.socket.as_mut().ok_or(SendError::NotConnected)?;
        socket
            .writer
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }
}

/// Forward inbound frames until the socket ends, then report why.
async fn read_loop(mut reader: SplitStream<Socket>, sink: PushSink) {
    let error = loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                if !forward(&sink, serde_json::from_str(&text)) {
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if !forward(&sink, serde_json::from_slice(&data)) {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => {
                        let code = u16::from(frame.code);
                        ConnectionError::new(
                            ConnectionFailure::from_close_code(code),
                            format!("closed by server ({code}): {}", frame.reason.as_str()),
                        )
                    }
                    None => ConnectionError::refused("closed by server"),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break classify(e),
            None => break ConnectionError::refused("stream ended"),
        }
    };

    warn!(error = %error, "push connection lost");
    sink.closed(error);
}

/// Hand a decoded envelope to the sink. Returns `false` once the receiver is gone.
fn forward(sink: &PushSink, decoded: Result<WireEvent, serde_json::Error>) -> bool {
    match decoded {
        Ok(event) => sink.event(event),
        Err(e) => {
            warn!(error = %e, "dropping malformed push frame");
            !sink.is_closed()
        }
    }
}

fn classify(error: WsError) -> ConnectionError {
    match error {
        WsError::Io(e) => match e.kind() {
            IoErrorKind::TimedOut => ConnectionError::timeout(e.to_string()),
            IoErrorKind::ConnectionRefused
            | IoErrorKind::ConnectionReset
            | IoErrorKind::ConnectionAborted
            | IoErrorKind::NotConnected
            | IoErrorKind::BrokenPipe
            | IoErrorKind::UnexpectedEof => ConnectionError::refused(e.to_string()),
            _ => ConnectionError::protocol(e.to_string()),
        },
        WsError::Http(response) => {
            ConnectionError::refused(format!("handshake rejected with HTTP {}", response.status()))
        }
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ConnectionError::refused(error.to_string())
        }
        other => ConnectionError::protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_io_errors() {
        let refused = classify(WsError::Io(std::io::Error::from(IoErrorKind::ConnectionRefused)));
        assert_eq!(refused.reason, ConnectionFailure::Refused);

        let timeout = classify(WsError::Io(std::io::Error::from(IoErrorKind::TimedOut)));
        assert_eq!(timeout.reason, ConnectionFailure::Timeout);

        let closed = classify(WsError::ConnectionClosed);
        assert_eq!(closed.reason, ConnectionFailure::Refused);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let push = WebSocketPush::new("ws://127.0.0.1:9/events/ws");
        let frame = SendRequest {
            event_type: "chat:send".into(),
            data: serde_json::Value::Null,
        };
        assert_eq!(push.send(&frame).await, Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_when_closed_is_noop() {
        let push = WebSocketPush::new("ws://127.0.0.1:9/events/ws");
        push.close().await;
        push.close().await;
    }
}
