//! Single-owner stream worker.
//!
//! One task per connection owns every piece of mutable state: the current
//! transport handle, the reconnect timer, the event buffer and the
//! heartbeat bookkeeping. Callers talk to it through [`Command`]s and
//! observe it through [`StreamSnapshot`]s published on a `watch` channel.
//!
//! The transport handle, an in-flight open and the reconnect timer all live
//! in one [`Link`] value, so at most one of them exists at any time.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};
use url::Url;

use crate::retry::{with_timeout, ReconnectPolicy};
use crate::stream::buffer::RecentEvents;
use crate::stream::client::{StreamClientError, StreamOptions};
use crate::stream::filters::SubscriptionFilters;
use crate::stream::listener::StreamListener;
use crate::stream::proto::{FrameError, StreamEvent, StreamMessage};
use crate::transport::{FrameStream, OpenRequest, Transport};

const STALE_PREFIX: &str = "connection may be stale";
const MIN_LIVENESS_PERIOD: Duration = Duration::from_millis(1);

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts of inbound frames dropped without being classified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DroppedFrames {
    /// Text that was not a JSON frame envelope.
    pub malformed: u64,
    /// Well-formed frames with a `type` this client does not handle.
    pub unknown_type: u64,
}

/// Point-in-time copy of everything a caller can observe.
#[derive(Clone, Debug, Default)]
pub struct StreamSnapshot {
    pub state: ConnectionState,
    /// Recent events, newest first.
    pub events: Vec<StreamEvent>,
    /// Last `stats` payload.
    pub stats: Option<Value>,
    /// Last transport failure, server error frame or staleness notice.
    pub last_error: Option<String>,
    /// Server timestamp of the last heartbeat, epoch milliseconds.
    pub last_heartbeat: Option<i64>,
    /// True while the heartbeat has been silent past the threshold.
    pub stale: bool,
    /// Reconnect attempts made in the current cycle.
    pub reconnect_attempts: u32,
    pub dropped: DroppedFrames,
}

impl StreamSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn has_error(&self) -> bool {
        self.state == ConnectionState::Error
    }

    /// Decodes the last stats payload, if any and if it matches `T`.
    pub fn stats_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.stats
            .as_ref()
            .and_then(|stats| T::deserialize(stats).ok())
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect(SubscriptionFilters),
    UpdateFilters(SubscriptionFilters),
    UpdateToken(Option<SecretString>),
    Reconnect,
    Disconnect,
    ClearEvents,
}

type OpenFuture = BoxFuture<'static, Result<FrameStream, StreamClientError>>;

enum Link {
    Idle,
    Opening(OpenFuture),
    Open {
        frames: FrameStream,
        liveness: Interval,
    },
    Waiting(Pin<Box<Sleep>>),
}

enum LinkOutcome {
    Opened(Result<FrameStream, StreamClientError>),
    Frame(Option<Result<String, StreamClientError>>),
    LivenessCheck,
    RetryDue,
}

impl Link {
    /// Resolves with the next thing that happened on the link.
    ///
    /// Cancel-safe. After `Opened` or `RetryDue` the link must be replaced
    /// before it is polled again.
    async fn next(&mut self) -> LinkOutcome {
        match self {
            Link::Idle => std::future::pending::<LinkOutcome>().await,
            Link::Opening(open) => LinkOutcome::Opened(open.await),
            // Tick first: an always-ready frame stream must not starve the
            // staleness check.
            Link::Open { frames, liveness } => {
                tokio::select! {
                    biased;
                    _ = liveness.tick() => LinkOutcome::LivenessCheck,
                    frame = frames.next() => LinkOutcome::Frame(frame),
                }
            }
            Link::Waiting(sleep) => {
                sleep.await;
                LinkOutcome::RetryDue
            }
        }
    }
}

pub(crate) struct StreamWorker {
    endpoint: Url,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn StreamListener>,
    snapshot_tx: watch::Sender<StreamSnapshot>,
    filters: SubscriptionFilters,
    token: Option<SecretString>,
    policy: ReconnectPolicy,
    stale_after: Duration,
    check_every: Duration,
    connect_timeout: Duration,
    state: ConnectionState,
    events: RecentEvents,
    stats: Option<Value>,
    last_error: Option<String>,
    last_heartbeat: Option<i64>,
    last_alive: Option<Instant>,
    stale: bool,
    attempts: u32,
    dropped: DroppedFrames,
    link: Link,
}

impl StreamWorker {
    pub(crate) fn new(
        endpoint: Url,
        transport: Arc<dyn Transport>,
        listener: Arc<dyn StreamListener>,
        token: Option<SecretString>,
        options: &StreamOptions,
        snapshot_tx: watch::Sender<StreamSnapshot>,
    ) -> Self {
        Self {
            endpoint,
            transport,
            listener,
            snapshot_tx,
            filters: options.filters.clone(),
            token,
            policy: options.reconnect.clone(),
            stale_after: options.heartbeat_stale_after,
            check_every: options.heartbeat_check_interval.max(MIN_LIVENESS_PERIOD),
            connect_timeout: options.connect_timeout,
            state: ConnectionState::Disconnected,
            events: RecentEvents::new(options.event_capacity),
            stats: None,
            last_error: None,
            last_heartbeat: None,
            last_alive: None,
            stale: false,
            attempts: 0,
            dropped: DroppedFrames::default(),
            link: Link::Idle,
        }
    }

    /// Runs until every command sender is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.publish();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                outcome = self.link.next() => self.handle_outcome(outcome),
            }
        }
        self.close_link("handle_dropped");
        debug!(event = "stream_worker_stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(filters) => {
                self.filters = filters;
                self.open();
            }
            Command::UpdateFilters(filters) => {
                self.filters = filters;
                debug!(event = "filters_updated", query = %self.filters.to_query());
            }
            Command::UpdateToken(token) => {
                self.token = token;
                debug!(event = "token_updated");
            }
            Command::Reconnect => {
                self.attempts = 0;
                self.open();
            }
            Command::Disconnect => self.disconnect(),
            Command::ClearEvents => {
                self.events.clear();
                self.publish();
            }
        }
    }

    fn handle_outcome(&mut self, outcome: LinkOutcome) {
        match outcome {
            LinkOutcome::Opened(Ok(frames)) => self.on_open(frames),
            LinkOutcome::Opened(Err(err)) => self.fail(err),
            LinkOutcome::Frame(Some(Ok(text))) => self.handle_frame(&text),
            LinkOutcome::Frame(Some(Err(err))) => self.fail(err),
            LinkOutcome::Frame(None) => self.fail(StreamClientError::Closed),
            LinkOutcome::LivenessCheck => self.check_liveness(),
            LinkOutcome::RetryDue => {
                self.attempts = self.attempts.saturating_add(1);
                info!(
                    event = "reconnect_attempt",
                    attempt = self.attempts,
                    max_attempts = self.policy.max_attempts
                );
                self.open();
            }
        }
    }

    /// Closes whatever the link holds and starts a fresh open.
    fn open(&mut self) {
        self.close_link("reopen");

        let url = self.filters.apply_to(&self.endpoint);
        info!(event = "stream_connecting", url = %url, attempt = self.attempts);

        let request = OpenRequest {
            url,
            token: self.token.clone(),
        };
        let transport = Arc::clone(&self.transport);
        let timeout = self.connect_timeout;
        self.link = Link::Opening(Box::pin(async move {
            match with_timeout(timeout, transport.open(request)).await {
                Ok(result) => result,
                Err(_) => Err(StreamClientError::ConnectTimeout(timeout)),
            }
        }));

        self.last_error = None;
        self.stale = false;
        self.set_state(ConnectionState::Connecting);
    }

    fn on_open(&mut self, frames: FrameStream) {
        let now = Instant::now();
        let mut liveness = tokio::time::interval_at(now + self.check_every, self.check_every);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.link = Link::Open { frames, liveness };

        self.last_alive = Some(now);
        self.attempts = 0;
        self.last_error = None;
        self.stale = false;
        info!(event = "stream_connected");
        self.set_state(ConnectionState::Connected);
        self.listener.on_connected();
    }

    fn fail(&mut self, err: StreamClientError) {
        self.close_link("transport_failure");

        let message = err.to_string();
        warn!(
            event = "stream_transport_failure",
            error = %message,
            attempt = self.attempts
        );
        self.stale = false;
        self.last_error = Some(message.clone());
        self.set_state(ConnectionState::Error);
        self.listener.on_error(&message);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.policy.auto_reconnect {
            debug!(event = "auto_reconnect_disabled");
            return;
        }

        match self.policy.next_attempt(self.attempts) {
            Some(attempt) => {
                let delay = self.policy.delay_for_attempt(attempt);
                debug!(
                    event = "reconnect_scheduled",
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                self.link = Link::Waiting(Box::pin(tokio::time::sleep(delay)));
            }
            None => {
                warn!(
                    event = "reconnect_budget_exhausted",
                    attempts = self.attempts,
                    max_attempts = self.policy.max_attempts
                );
                self.set_state(ConnectionState::Disconnected);
                self.listener.on_disconnected();
            }
        }
    }

    fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected && matches!(self.link, Link::Idle) {
            debug!(event = "disconnect_ignored");
            return;
        }

        self.close_link("disconnect");
        self.stale = false;
        info!(event = "stream_disconnected");
        self.set_state(ConnectionState::Disconnected);
        self.listener.on_disconnected();
    }

    fn handle_frame(&mut self, text: &str) {
        match StreamMessage::from_text(text) {
            Ok(message) => self.apply_message(message),
            Err(FrameError::Malformed(err)) => {
                self.dropped.malformed += 1;
                debug!(event = "frame_dropped", reason = "malformed", error = %err);
                self.publish();
            }
            Err(FrameError::UnknownType(kind)) => {
                self.dropped.unknown_type += 1;
                debug!(event = "frame_dropped", reason = "unknown_type", kind = %kind);
                self.publish();
            }
        }
    }

    fn apply_message(&mut self, message: StreamMessage) {
        match message {
            StreamMessage::Connected => {
                self.attempts = 0;
                debug!(event = "subscription_acknowledged");
                self.publish();
            }
            StreamMessage::Event(event) => {
                self.events.push(event.clone());
                self.publish();
                self.listener.on_event(&event);
            }
            StreamMessage::Heartbeat { timestamp } => {
                self.last_heartbeat = Some(timestamp);
                self.last_alive = Some(Instant::now());
                if self.stale {
                    self.stale = false;
                    if self
                        .last_error
                        .as_deref()
                        .is_some_and(|message| message.starts_with(STALE_PREFIX))
                    {
                        self.last_error = None;
                    }
                    info!(event = "heartbeat_resumed");
                }
                self.publish();
            }
            StreamMessage::Stats(stats) => {
                self.stats = Some(stats);
                self.publish();
            }
            StreamMessage::Error { message } => {
                warn!(event = "server_error_frame", error = %message);
                self.last_error = Some(message.clone());
                self.publish();
                self.listener.on_error(&message);
            }
        }
    }

    fn check_liveness(&mut self) {
        if self.state != ConnectionState::Connected || self.stale {
            return;
        }
        let Some(last_alive) = self.last_alive else {
            return;
        };

        let silent = last_alive.elapsed();
        if silent < self.stale_after {
            return;
        }

        warn!(
            event = "heartbeat_stale",
            silent_ms = silent.as_millis() as u64,
            threshold_ms = self.stale_after.as_millis() as u64
        );
        self.stale = true;
        self.last_error = Some(format!(
            "{STALE_PREFIX}: no heartbeat for {}s",
            silent.as_secs()
        ));
        self.publish();
    }

    fn close_link(&mut self, reason: &'static str) {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Idle => {}
            Link::Opening(_) => debug!(event = "stream_open_abandoned", reason),
            Link::Open { .. } => debug!(event = "stream_handle_closed", reason),
            Link::Waiting(_) => debug!(event = "reconnect_timer_cancelled", reason),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        let changed = self.state != state;
        self.state = state;
        self.publish();
        if changed {
            self.listener.on_state_changed(state);
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(StreamSnapshot {
            state: self.state,
            events: self.events.to_vec(),
            stats: self.stats.clone(),
            last_error: self.last_error.clone(),
            last_heartbeat: self.last_heartbeat,
            stale: self.stale,
            reconnect_attempts: self.attempts,
            dropped: self.dropped,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;
    use tokio::time::{Instant, MissedTickBehavior};

    use super::{Link, LinkOutcome};
    use crate::stream::client::StreamClientError;

    fn busy_link(first_tick: Instant) -> Link {
        let frames = stream::repeat_with(|| {
            Ok::<_, StreamClientError>(r#"{"type":"event","data":{}}"#.to_string())
        });
        let mut liveness = tokio::time::interval_at(first_tick, Duration::from_secs(30));
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Link::Open {
            frames: Box::pin(frames),
            liveness,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn due_liveness_check_wins_over_ready_frames() {
        let mut link = busy_link(Instant::now());

        assert!(matches!(link.next().await, LinkOutcome::LivenessCheck));
        assert!(matches!(link.next().await, LinkOutcome::Frame(Some(Ok(_)))));
        assert!(matches!(link.next().await, LinkOutcome::Frame(Some(Ok(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_check_fires_again_during_a_frame_burst() {
        let mut link = busy_link(Instant::now() + Duration::from_secs(30));

        for _ in 0..10 {
            assert!(matches!(link.next().await, LinkOutcome::Frame(Some(Ok(_)))));
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(link.next().await, LinkOutcome::LivenessCheck));
    }

    #[tokio::test]
    async fn idle_and_waiting_links_resolve_as_expected() {
        let mut idle = Link::Idle;
        let pending = tokio::time::timeout(Duration::from_millis(5), idle.next()).await;
        assert!(pending.is_err());

        let mut waiting = Link::Waiting(Box::pin(tokio::time::sleep(Duration::from_millis(1))));
        assert!(matches!(waiting.next().await, LinkOutcome::RetryDue));
    }
}
