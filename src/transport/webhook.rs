//! HTTP webhook transport
//!
//! Each identity's session is a set of endpoints under
//! `{base-url}/identities/{identity}`, with the identity percent-encoded as
//! a single path segment:
//! - `POST .../connect`
//! - `POST .../messages` with `{"target": ..., "payload": ...}`
//! - `POST .../disconnect`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{debug, warn};

use super::{SendError, TransportClient};
use crate::config::TransportConfig;

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    target: &'a str,
    payload: &'a str,
}

/// Map an HTTP status onto a send outcome
fn classify(status: u16, retry_after: Option<u64>, body: String, default_cooldown: Duration) -> Result<(), SendError> {
    match status {
        200..=299 => Ok(()),
        429 => Err(SendError::RateLimited {
            cooldown: retry_after.map(Duration::from_secs).unwrap_or(default_cooldown),
        }),
        401 | 403 => Err(SendError::Permanent(format!("identity unauthorized ({}): {}", status, body))),
        408 => Err(SendError::Transient(format!("request timeout: {}", body))),
        400..=499 => Err(SendError::Permanent(format!("rejected ({}): {}", status, body))),
        _ => Err(SendError::Transient(format!("provider error ({}): {}", status, body))),
    }
}

/// Transport that posts to an HTTP endpoint
pub struct WebhookTransport {
    base_url: Url,
    http: Client,
    token: Option<String>,
    default_cooldown: Duration,
}

impl WebhookTransport {
    /// Create a transport from configuration
    ///
    /// Reads the bearer token from the environment variable named in config.
    pub fn from_config(config: &TransportConfig) -> Result<Self, SendError> {
        debug!(?config, "from_config: called");
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| SendError::Permanent(format!("invalid base url {}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SendError::Permanent(format!("base url {} cannot take a path", config.base_url)));
        }

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SendError::Permanent(format!("http client: {}", e)))?;

        let token = match &config.token_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| SendError::Permanent(format!("environment variable {} not set", var)))?,
            ),
            None => None,
        };

        Ok(Self {
            base_url,
            http,
            token,
            default_cooldown: Duration::from_millis(config.default_cooldown_ms),
        })
    }

    fn url(&self, identity_id: &str, action: &str) -> Result<Url, SendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SendError::Permanent(format!("base url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["identities", identity_id, action]);
        Ok(url)
    }

    async fn post<T: Serialize + ?Sized>(&self, url: Url, body: &T) -> Result<(), SendError> {
        let mut request = self.http.post(url.clone()).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            debug!(%url, error = %e, "post: network error");
            SendError::from(e)
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = if response.status().is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        debug!(%url, status, "post: response");
        classify(status, retry_after, body, self.default_cooldown)
    }
}

#[async_trait]
impl TransportClient for WebhookTransport {
    async fn connect(&self, identity_id: &str) -> Result<(), SendError> {
        debug!(%identity_id, "connect: called");
        self.post(self.url(identity_id, "connect")?, &serde_json::json!({})).await
    }

    async fn send(&self, identity_id: &str, target: &str, payload: &str) -> Result<(), SendError> {
        debug!(%identity_id, %target, payload_len = payload.len(), "send: called");
        self.post(self.url(identity_id, "messages")?, &OutboundMessage { target, payload })
            .await
    }

    async fn disconnect(&self, identity_id: &str) {
        debug!(%identity_id, "disconnect: called");
        let result = match self.url(identity_id, "disconnect") {
            Ok(url) => self.post(url, &serde_json::json!({})).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(%identity_id, error = %e, "disconnect failed");
        }
    }
}
