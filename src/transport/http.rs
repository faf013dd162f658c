//! HTTP polling transport.
//!
//! `POST {base}/events/poll` fetches events newer than a cursor and
//! `POST {base}/events/send` delivers one outbound message. Bodies are JSON.

use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::core::constants::{DEFAULT_REQUEST_TIMEOUT, POLL_PATH, SEND_PATH};
use crate::core::{
    LinkError, PollRequest, PollResponse, PollTransport, PollingError, SendError, SendRequest,
    SendResponse,
};

/// [`PollTransport`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpPolling {
    client: Client,
    poll_url: Url,
    send_url: Url,
}

impl HttpPolling {
    /// Create a transport for the server rooted at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if the HTTP client cannot be built or
    /// `base` cannot carry a path.
    pub fn new(base: Url) -> Result<Self, LinkError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LinkError::Config(format!("http client: {e}")))?;
        Self::with_client(client, base)
    }

    /// Create a transport that reuses an existing client.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if `base` cannot carry a path.
    pub fn with_client(client: Client, base: Url) -> Result<Self, LinkError> {
        Ok(Self {
            client,
            poll_url: endpoint(&base, POLL_PATH)?,
            send_url: endpoint(&base, SEND_PATH)?,
        })
    }

    /// Resolved poll endpoint.
    pub fn poll_url(&self) -> &Url {
        &self.poll_url
    }

    /// Resolved send endpoint.
    pub fn send_url(&self) -> &Url {
        &self.send_url
    }
}

/// Join `path` onto `base`, keeping any path prefix `base` already has.
fn endpoint(base: &Url, path: &str) -> Result<Url, LinkError> {
    if base.cannot_be_a_base() {
        return Err(LinkError::Config(format!("`{base}` cannot be a base url")));
    }
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|e| LinkError::Config(format!("invalid endpoint `{path}`: {e}")))
}

impl PollTransport for HttpPolling {
    async fn poll(&self, request: &PollRequest) -> Result<PollResponse, PollingError> {
        debug!(
            url = %self.poll_url,
            channel = %request.channel_id,
            last_timestamp = request.last_timestamp,
            "polling"
        );

        let response = self
            .client
            .post(self.poll_url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| PollingError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollingError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PollingError::Request(e.to_string()))?;
        let decoded: PollResponse =
            serde_json::from_slice(&body).map_err(|e| PollingError::Decode(e.to_string()))?;

        debug!(events = decoded.events.len(), "poll returned");
        Ok(decoded)
    }

    async fn send_once(&self, frame: &SendRequest) -> Result<(), SendError> {
        debug!(url = %self.send_url, event_type = %frame.event_type, "sending over http");

        let response = self
            .client
            .post(self.send_url.clone())
            .json(frame)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SendError::Rejected);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let ack: SendResponse =
            serde_json::from_slice(&body).map_err(|e| SendError::Transport(e.to_string()))?;

        if ack.success {
            Ok(())
        } else {
            Err(SendError::Rejected)
        }
    }
}
