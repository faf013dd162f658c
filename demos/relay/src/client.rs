//! Relay client.
//!
//! Subscribes to one scope, prints every event, and emits a heartbeat every
//! few seconds. Stop and restart the server to watch the session reconnect,
//! degrade to polling and upgrade back.

use std::time::Duration;

use relink::prelude::*;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use crate::RelayError;

/// Time between heartbeat messages.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Push endpoint for an HTTP base URL.
fn push_url(base: &Url) -> Result<String, RelayError> {
    let mut ws = base
        .join("events/ws")
        .map_err(|e| RelayError::Config(format!("RELAY_SERVER_URL: {e}")))?;
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    ws.set_scheme(scheme)
        .map_err(|()| RelayError::Config(format!("cannot derive a push url from `{base}`")))?;
    Ok(ws.into())
}

/// Run until Ctrl-C.
pub async fn run(base: Url, scope: ScopeKey) -> Result<(), RelayError> {
    let config = ManagerConfig::from_env()?;
    let manager = ConnectionManager::new(
        config,
        WebSocketPush::new(push_url(&base)?),
        HttpPolling::new(base)?,
    )?;

    manager.on("*", |event| {
        info!(
            event_type = %event.event_type,
            timestamp = event.timestamp,
            data = %event.data,
            "event"
        );
    });
    manager.on_error(|error| warn!(error = %error, "relay error"));
    manager.connect(scope.clone())?;

    let mut status = manager.watch_status();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut beats = 0u64;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(
                    state = %current.state,
                    attempts = current.reconnect_attempts,
                    polling = current.use_polling,
                    "status"
                );
            }
            _ = heartbeat.tick() => {
                beats += 1;
                let mut data = json!({ "beat": beats });
                if let (Some(target), Ok(serde_json::Value::Object(fields))) =
                    (data.as_object_mut(), serde_json::to_value(&scope))
                {
                    target.extend(fields);
                }
                manager.emit(scope.clone(), "chat:heartbeat", data)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    manager.dispose().await;
    Ok(())
}
