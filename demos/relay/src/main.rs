//! relink relay demo
//!
//! Runs either an in-memory event server speaking both wire contracts, or a
//! client that keeps a session alive across server restarts.
//!
//! Environment variables:
//! - RELAY_MODE: "server" or "client"
//! - RELAY_BIND_ADDR: Bind address (server only, default 127.0.0.1:8080)
//! - RELAY_SERVER_URL: Server base URL (client only, default http://127.0.0.1:8080)
//! - RELAY_SCOPE: Scope to subscribe to (client only, default demo/lobby/general)
//! - RELAY_LOG_LEVEL: debug|info|warn|error (RUST_LOG takes precedence)
//!
//! The client also reads the `RELINK_*` manager settings.

mod client;
mod server;

use std::net::SocketAddr;

use relink::LinkError;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_SCOPE: &str = "demo/lobby/general";

/// Relay demo errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket I/O.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection manager error.
    #[error(transparent)]
    Link(#[from] LinkError),
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn run() -> Result<(), RelayError> {
    match env_or("RELAY_MODE", "server").as_str() {
        "server" => {
            let bind: SocketAddr = env_or("RELAY_BIND_ADDR", DEFAULT_BIND_ADDR)
                .parse()
                .map_err(|e| RelayError::Config(format!("RELAY_BIND_ADDR: {e}")))?;
            server::run(bind).await
        }
        "client" => {
            let base = url::Url::parse(&env_or("RELAY_SERVER_URL", DEFAULT_SERVER_URL))
                .map_err(|e| RelayError::Config(format!("RELAY_SERVER_URL: {e}")))?;
            let scope = env_or("RELAY_SCOPE", DEFAULT_SCOPE)
                .parse()
                .map_err(LinkError::from)?;
            client::run(base, scope).await
        }
        other => Err(RelayError::Config(format!(
            "RELAY_MODE must be `server` or `client`, got `{other}`"
        ))),
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(env_or("RELAY_LOG_LEVEL", "info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        error!(error = %e, "relay exited");
        std::process::exit(1);
    }
}
