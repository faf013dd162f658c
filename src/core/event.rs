//! Events, outbound messages, and the JSON wire envelopes.
//!
//! Both transports speak the same logical envelope: inbound
//! `{ type, data, timestamp }` and outbound `{ type, data }`. The polling
//! contract wraps inbound events in `{ events: [...] }` and addresses a scope
//! with `{ lastTimestamp, userId, serverId, channelId }`.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::constants::{SUBSCRIBE_FRAME, UNSUBSCRIBE_FRAME};
use super::error::ScopeParseError;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Addressing key of a subscription: the user/server/channel triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeKey {
    /// User the subscription belongs to.
    pub user_id: String,
    /// Server (workspace) identifier.
    pub server_id: String,
    /// Channel identifier.
    pub channel_id: String,
}

impl ScopeKey {
    /// Create a scope key.
    pub fn new(
        user_id: impl Into<String>,
        server_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            server_id: server_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.server_id, self.channel_id)
    }
}

impl FromStr for ScopeKey {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(server), Some(channel), None)
                if !user.is_empty() && !server.is_empty() && !channel.is_empty() =>
            {
                Ok(Self::new(user, server, channel))
            }
            _ => Err(ScopeParseError(s.to_string())),
        }
    }
}

/// An event accepted by the dedup filter and handed to subscribers.
///
/// Subscribers receive `&InboundEvent`; `data` is shared between all of
/// them and is never handed out mutably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Application event type, e.g. `message:new`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    pub data: Value,
    /// Server timestamp; the cursor position of this event.
    pub timestamp: i64,
    /// Scope the event was delivered for.
    pub scope: ScopeKey,
}

/// A message waiting in, or travelling through, the outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Scope the message was emitted for.
    pub scope: ScopeKey,
    /// Application event type, e.g. `chat:send`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    pub data: Value,
    /// Enqueue time, milliseconds since the Unix epoch.
    pub enqueued_at: i64,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Exempt from overflow eviction while non-critical messages remain.
    pub critical: bool,
}

impl OutboundMessage {
    /// Create a message stamped with the current time.
    pub fn new(scope: ScopeKey, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            scope,
            event_type: event_type.into(),
            data,
            enqueued_at: now_ms(),
            attempts: 0,
            critical: false,
        }
    }

    /// Mark the message as critical.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Inbound envelope as it appears on either wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Application event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Server timestamp.
    pub timestamp: i64,
    /// Scope the event belongs to; optional on the push wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeKey>,
}

impl WireEvent {
    /// Create an unscoped envelope.
    pub fn new(event_type: impl Into<String>, data: Value, timestamp: i64) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp,
            scope: None,
        }
    }

    /// Attach a scope to the envelope.
    pub fn with_scope(mut self, scope: ScopeKey) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Bind the envelope to the scope it is delivered for.
    pub fn into_inbound(self, scope: ScopeKey) -> InboundEvent {
        InboundEvent {
            event_type: self.event_type,
            data: self.data,
            timestamp: self.timestamp,
            scope,
        }
    }
}

/// Body of `POST /events/poll`, also the payload of a push `subscribe` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    /// Cursor value of the scope; the server returns strictly newer events.
    pub last_timestamp: i64,
    /// User identifier.
    pub user_id: String,
    /// Server identifier.
    pub server_id: String,
    /// Channel identifier.
    pub channel_id: String,
}

impl PollRequest {
    /// Build a request for `scope` resuming after `last_timestamp`.
    pub fn new(scope: &ScopeKey, last_timestamp: i64) -> Self {
        Self {
            last_timestamp,
            user_id: scope.user_id.clone(),
            server_id: scope.server_id.clone(),
            channel_id: scope.channel_id.clone(),
        }
    }

    /// The scope this request addresses.
    pub fn scope(&self) -> ScopeKey {
        ScopeKey::new(&self.user_id, &self.server_id, &self.channel_id)
    }
}

/// Body of a `POST /events/poll` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Events newer than the request cursor, ascending by timestamp.
    #[serde(default)]
    pub events: Vec<WireEvent>,
}

/// Outbound envelope: body of `POST /events/send` and every push frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Application or control frame type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
}

impl SendRequest {
    /// Push control frame resuming `request`'s scope from its cursor.
    pub fn subscribe(request: &PollRequest) -> Self {
        Self {
            event_type: SUBSCRIBE_FRAME.to_string(),
            data: serde_json::to_value(request).unwrap_or(Value::Null),
        }
    }

    /// Push control frame ending the stream for `scope`.
    pub fn unsubscribe(scope: &ScopeKey) -> Self {
        Self {
            event_type: UNSUBSCRIBE_FRAME.to_string(),
            data: serde_json::to_value(scope).unwrap_or(Value::Null),
        }
    }

    /// Whether this is a subscribe/unsubscribe control frame.
    pub fn is_control(&self) -> bool {
        self.event_type == SUBSCRIBE_FRAME || self.event_type == UNSUBSCRIBE_FRAME
    }
}

impl From<&OutboundMessage> for SendRequest {
    fn from(message: &OutboundMessage) -> Self {
        Self {
            event_type: message.event_type.clone(),
            data: message.data.clone(),
        }
    }
}

/// Body of a `POST /events/send` response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    /// Whether the server accepted the message.
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_key_parse_and_display() {
        let scope: ScopeKey = "u1/s1/general".parse().unwrap();
        assert_eq!(scope, ScopeKey::new("u1", "s1", "general"));
        assert_eq!(scope.to_string(), "u1/s1/general");

        assert!("u1/s1".parse::<ScopeKey>().is_err());
        assert!("u1/s1/c1/extra".parse::<ScopeKey>().is_err());
        assert!("u1//c1".parse::<ScopeKey>().is_err());
    }

    #[test]
    fn test_poll_request_wire_shape() {
        let scope = ScopeKey::new("u1", "s1", "c1");
        let request = PollRequest::new(&scope, 42);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"lastTimestamp": 42, "userId": "u1", "serverId": "s1", "channelId": "c1"})
        );
        assert_eq!(request.scope(), scope);
    }

    #[test]
    fn test_poll_response_decodes_wire_example() {
        let body = r#"{"events":[{"type":"message:new","data":{"id":"m1"},"timestamp":100}]}"#;
        let response: PollResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].event_type, "message:new");
        assert_eq!(response.events[0].timestamp, 100);
        assert_eq!(response.events[0].scope, None);
    }

    #[test]
    fn test_missing_events_field_is_empty() {
        let response: PollResponse = serde_json::from_str("{}").unwrap();
        assert!(response.events.is_empty());
    }

    #[test]
    fn test_subscribe_frame_carries_cursor() {
        let scope = ScopeKey::new("u1", "s1", "c1");
        let frame = SendRequest::subscribe(&PollRequest::new(&scope, 100));
        assert!(frame.is_control());
        assert_eq!(frame.event_type, "subscribe");
        assert_eq!(frame.data["lastTimestamp"], 100);
        assert_eq!(frame.data["channelId"], "c1");
    }

    #[test]
    fn test_send_request_from_message_drops_bookkeeping() {
        let message = OutboundMessage::new(
            ScopeKey::new("u1", "s1", "c1"),
            "chat:send",
            json!({"text": "hi"}),
        );
        let frame = SendRequest::from(&message);
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "chat:send", "data": {"text": "hi"}})
        );
        assert!(!frame.is_control());
    }
}
