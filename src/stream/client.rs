//! Stream client entry point and connection handle.
//!
//! [`StreamClient`] holds the endpoint, session token and options.
//! [`StreamClient::open`] spawns the background worker that owns the
//! transport and returns a cloneable [`StreamConnection`] handle. Every
//! handle method is non-blocking: it enqueues a command and returns.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Error as WsError;
use url::Url;

use crate::retry::ReconnectPolicy;
use crate::stream::buffer::DEFAULT_EVENT_CAPACITY;
use crate::stream::filters::SubscriptionFilters;
use crate::stream::listener::{ChannelListener, StreamListener, StreamNotification};
use crate::stream::proto::StreamEvent;
use crate::stream::session::{Command, ConnectionState, StreamSnapshot, StreamWorker};
use crate::transport::{self, Transport};

/// Security event stream served by the local security API.
pub const LOCAL_STREAM_ENDPOINT: &str = "http://localhost:8001/api/security-events/stream";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const AUTO_RECONNECT: bool = true;
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
    pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(120);
    pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
    pub const EVENT_CAPACITY: usize = DEFAULT_EVENT_CAPACITY;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Caller-facing configuration for one connection.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Filters used until `connect` or `update_filters` replaces them.
    pub filters: SubscriptionFilters,
    pub reconnect: ReconnectPolicy,
    /// Heartbeat silence after which the connection is flagged stale.
    pub heartbeat_stale_after: Duration,
    /// How often staleness is evaluated while connected.
    pub heartbeat_check_interval: Duration,
    /// Capacity of the recent event buffer.
    pub event_capacity: usize,
    /// Upper bound on a single transport open.
    pub connect_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            filters: SubscriptionFilters::default(),
            reconnect: ReconnectPolicy {
                auto_reconnect: StreamDefaults::AUTO_RECONNECT,
                max_attempts: StreamDefaults::MAX_RECONNECT_ATTEMPTS,
                initial_backoff: StreamDefaults::RECONNECT_BASE_DELAY,
                max_backoff: StreamDefaults::RECONNECT_MAX_DELAY,
                jitter: Duration::ZERO,
            },
            heartbeat_stale_after: StreamDefaults::HEARTBEAT_STALE_AFTER,
            heartbeat_check_interval: StreamDefaults::HEARTBEAT_CHECK_INTERVAL,
            event_capacity: StreamDefaults::EVENT_CAPACITY,
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
        }
    }
}

impl StreamOptions {
    pub fn with_filters(mut self, filters: SubscriptionFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.auto_reconnect = enabled;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect.initial_backoff = delay;
        self
    }

    pub fn with_reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect.max_backoff = delay;
        self
    }

    pub fn with_heartbeat_stale_after(mut self, threshold: Duration) -> Self {
        self.heartbeat_stale_after = threshold;
        self
    }

    pub fn with_heartbeat_check_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_check_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Entry point for creating stream connections.
#[derive(Clone)]
pub struct StreamClient {
    endpoint: Url,
    token: Option<SecretString>,
    options: StreamOptions,
    transport: Option<Arc<dyn Transport>>,
}

impl StreamClient {
    /// Creates a client for `endpoint`.
    ///
    /// `http`/`https` endpoints use the SSE transport and `ws`/`wss`
    /// endpoints the websocket transport, unless [`with_transport`] is set.
    ///
    /// [`with_transport`]: StreamClient::with_transport
    pub fn new(endpoint: &str) -> Result<Self, StreamClientError> {
        let endpoint = Url::parse(endpoint.trim())?;
        match endpoint.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => return Err(StreamClientError::UnsupportedScheme(other.to_string())),
        }
        Ok(Self {
            endpoint,
            token: None,
            options: StreamOptions::default(),
            transport: None,
        })
    }

    /// Creates a client for [`LOCAL_STREAM_ENDPOINT`].
    pub fn local() -> Result<Self, StreamClientError> {
        Self::new(LOCAL_STREAM_ENDPOINT)
    }

    /// Sets the session token sent as a bearer credential on every open.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the scheme-selected transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Spawns the stream worker in the `disconnected` state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<L>(&self, listener: L) -> Result<StreamConnection, StreamClientError>
    where
        L: StreamListener,
    {
        let runtime = Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;
        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => {
                let http = reqwest::Client::builder()
                    .connect_timeout(self.options.connect_timeout)
                    .build()?;
                transport::for_endpoint(&self.endpoint, http)?
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(StreamSnapshot::default());
        let worker = StreamWorker::new(
            self.endpoint.clone(),
            transport,
            Arc::new(listener),
            self.token.clone(),
            &self.options,
            snapshot_tx,
        );
        runtime.spawn(worker.run(command_rx));

        Ok(StreamConnection {
            commands: command_tx,
            snapshot: snapshot_rx,
        })
    }

    /// Spawns the worker with a [`ChannelListener`] and returns its receiver.
    pub fn open_with_channel(
        &self,
    ) -> Result<
        (
            StreamConnection,
            mpsc::UnboundedReceiver<StreamNotification>,
        ),
        StreamClientError,
    > {
        let (listener, notifications) = ChannelListener::new();
        let connection = self.open(listener)?;
        Ok((connection, notifications))
    }

    /// Spawns the worker and immediately connects with the configured filters.
    pub fn connect<L>(&self, listener: L) -> Result<StreamConnection, StreamClientError>
    where
        L: StreamListener,
    {
        let connection = self.open(listener)?;
        connection.connect(self.options.filters.clone())?;
        Ok(connection)
    }
}

/// Handle to a running stream worker.
///
/// Clones share the same worker. When the last clone is dropped the worker
/// closes its transport handle and stops.
#[derive(Clone, Debug)]
pub struct StreamConnection {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<StreamSnapshot>,
}

impl StreamConnection {
    /// Stores `filters` and opens a new transport handle, closing any prior one.
    ///
    /// Does not reset the reconnect attempt counter.
    pub fn connect(&self, filters: SubscriptionFilters) -> Result<(), StreamClientError> {
        self.send(Command::Connect(filters))
    }

    /// Stores `filters` for the next open without reconnecting.
    pub fn update_filters(&self, filters: SubscriptionFilters) -> Result<(), StreamClientError> {
        self.send(Command::UpdateFilters(filters))
    }

    /// Replaces the session token read at every open.
    pub fn update_token(&self, token: Option<SecretString>) -> Result<(), StreamClientError> {
        self.send(Command::UpdateToken(token))
    }

    /// Resets the attempt counter and reopens with the current filters.
    pub fn reconnect(&self) -> Result<(), StreamClientError> {
        self.send(Command::Reconnect)
    }

    /// Cancels any scheduled reconnect and closes the handle. Idempotent.
    pub fn disconnect(&self) -> Result<(), StreamClientError> {
        self.send(Command::Disconnect)
    }

    /// Empties the recent event buffer.
    pub fn clear_events(&self) -> Result<(), StreamClientError> {
        self.send(Command::ClearEvents)
    }

    /// Copies the latest published state.
    pub fn snapshot(&self) -> StreamSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Recent events, newest first.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.snapshot.borrow().events.clone()
    }

    pub fn stats(&self) -> Option<serde_json::Value> {
        self.snapshot.borrow().stats.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.snapshot.borrow().last_error.clone()
    }

    pub fn last_heartbeat(&self) -> Option<i64> {
        self.snapshot.borrow().last_heartbeat
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.snapshot.borrow().is_connecting()
    }

    pub fn has_error(&self) -> bool {
        self.snapshot.borrow().has_error()
    }

    /// Returns a receiver notified after every published change.
    pub fn watch(&self) -> watch::Receiver<StreamSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<StreamSnapshot, StreamClientError>
    where
        F: FnMut(&StreamSnapshot) -> bool,
    {
        let mut snapshot = self.snapshot.clone();
        let matched = snapshot
            .wait_for(predicate)
            .await
            .map(|current| current.clone())
            .map_err(|_| StreamClientError::SendQueueClosed)?;
        Ok(matched)
    }

    fn send(&self, command: Command) -> Result<(), StreamClientError> {
        self.commands
            .send(command)
            .map_err(|_| StreamClientError::SendQueueClosed)
    }
}

/// Errors produced by stream transport and client handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Endpoint could not be parsed as a URL.
    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Endpoint scheme has no matching transport.
    #[error("unsupported endpoint scheme `{0}`")]
    UnsupportedScheme(String),

    /// Session token could not be converted to a valid header value.
    #[error("session token is not a valid header value")]
    InvalidToken,

    /// Server answered the subscription with a non-success status.
    #[error("stream endpoint responded with status {0}")]
    Status(u16),

    /// Opening the transport took longer than the configured timeout.
    #[error("timed out opening stream after {0:?}")]
    ConnectTimeout(Duration),

    /// A single pending frame exceeded the decoder limit.
    #[error("stream frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// Server ended the stream.
    #[error("stream closed by server")]
    Closed,

    /// The worker has stopped and no longer accepts commands.
    #[error("command queue is closed")]
    SendQueueClosed,

    /// No tokio runtime was available to run the worker.
    #[error("no tokio runtime available to run the stream worker")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{StreamClient, StreamClientError, StreamOptions, LOCAL_STREAM_ENDPOINT};
    use crate::stream::listener::NoopListener;

    #[test]
    fn local_client_uses_local_endpoint() {
        let client = StreamClient::local().expect("local client");
        assert_eq!(client.endpoint().as_str(), LOCAL_STREAM_ENDPOINT);
    }

    #[test]
    fn endpoint_is_trimmed() {
        let client =
            StreamClient::new("wss://ops.example/stream   \n").expect("client with endpoint");
        assert_eq!(client.endpoint().as_str(), "wss://ops.example/stream");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(matches!(
            StreamClient::new("ftp://ops.example/stream"),
            Err(StreamClientError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
        assert!(matches!(
            StreamClient::new("not a url"),
            Err(StreamClientError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn default_options_match_dashboard_contract() {
        let options = StreamOptions::default();
        assert!(options.reconnect.auto_reconnect);
        assert_eq!(options.reconnect.max_attempts, 10);
        assert_eq!(options.reconnect.initial_backoff, Duration::from_secs(5));
        assert_eq!(options.reconnect.max_backoff, Duration::from_secs(30));
        assert_eq!(options.heartbeat_stale_after, Duration::from_secs(120));
        assert_eq!(options.heartbeat_check_interval, Duration::from_secs(30));
        assert_eq!(options.event_capacity, 100);
        assert!(options.filters.is_unrestricted());
    }

    #[test]
    fn builder_methods_override_defaults() {
        let options = StreamOptions::default()
            .with_auto_reconnect(false)
            .with_max_reconnect_attempts(3)
            .with_reconnect_base_delay(Duration::from_millis(250))
            .with_event_capacity(10);
        assert!(!options.reconnect.auto_reconnect);
        assert_eq!(options.reconnect.max_attempts, 3);
        assert_eq!(options.reconnect.initial_backoff, Duration::from_millis(250));
        assert_eq!(options.event_capacity, 10);
    }

    #[test]
    fn open_outside_runtime_is_an_error() {
        let client = StreamClient::local().expect("local client");
        assert!(matches!(
            client.open(NoopListener),
            Err(StreamClientError::NoRuntime)
        ));
    }
}
