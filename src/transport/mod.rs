//! Server-push transports.
//!
//! A transport opens one long-lived channel per call to [`Transport::open`]
//! and yields its text frames. Dropping the returned [`FrameStream`] closes
//! the channel. Reconnecting is always done by opening again.
//!
//! - `sse`: HTTP streaming GET (`text/event-stream` or newline-delimited JSON).
//! - `ws`: websocket text frames.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use secrecy::SecretString;
use url::Url;

use crate::stream::client::StreamClientError;

/// Server-sent events and NDJSON over a streaming HTTP response.
pub mod sse;
/// Websocket text frames.
pub mod ws;

pub use sse::SseTransport;
pub use ws::WsTransport;

/// Text frames from one open channel. The stream ends when the server closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, StreamClientError>> + Send>>;

/// Parameters for a single open.
#[derive(Clone, Debug)]
pub struct OpenRequest {
    /// Subscription target, filters already applied.
    pub url: Url,
    /// Opaque bearer token from the authentication provider.
    pub token: Option<SecretString>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a new channel. Success is the open acknowledgment.
    async fn open(&self, request: OpenRequest) -> Result<FrameStream, StreamClientError>;
}

/// Picks the transport matching the endpoint scheme.
pub fn for_endpoint(
    endpoint: &Url,
    http: reqwest::Client,
) -> Result<Arc<dyn Transport>, StreamClientError> {
    match endpoint.scheme() {
        "http" | "https" => Ok(Arc::new(SseTransport::new(http))),
        "ws" | "wss" => Ok(Arc::new(WsTransport)),
        other => Err(StreamClientError::UnsupportedScheme(other.to_string())),
    }
}

pub(crate) fn bearer_value(token: &SecretString) -> String {
    use secrecy::ExposeSecret;

    format!("Bearer {}", token.expose_secret())
}
