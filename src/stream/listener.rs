//! Lifecycle and event callbacks invoked by the stream worker.
//!
//! Callbacks run synchronously on the worker task, in the order the
//! transitions happen. Handlers that need to do real work should enqueue it
//! elsewhere; [`ChannelListener`] does exactly that.

use tokio::sync::mpsc;

use crate::stream::proto::StreamEvent;
use crate::stream::session::ConnectionState;

/// Observer for a [`StreamConnection`](crate::stream::client::StreamConnection).
///
/// Every method has a no-op default.
pub trait StreamListener: Send + Sync + 'static {
    /// The transport opened and the subscription is live.
    fn on_connected(&self) {}

    /// One domain event, in arrival order.
    fn on_event(&self, _event: &StreamEvent) {}

    /// A transport failure or a server-reported error frame.
    fn on_error(&self, _message: &str) {}

    /// The connection went to `disconnected`, by request or because the
    /// reconnect budget ran out.
    fn on_disconnected(&self) {}

    /// Any change of [`ConnectionState`].
    fn on_state_changed(&self, _state: ConnectionState) {}
}

/// Listener that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl StreamListener for NoopListener {}

/// Notification forwarded by [`ChannelListener`].
#[derive(Clone, Debug, PartialEq)]
pub enum StreamNotification {
    Connected,
    Event(StreamEvent),
    Error(String),
    Disconnected,
    StateChanged(ConnectionState),
}

/// Listener that forwards every callback onto an unbounded channel.
///
/// Notifications are dropped once the receiver is gone.
#[derive(Clone, Debug)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<StreamNotification>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: StreamNotification) {
        let _ = self.tx.send(notification);
    }
}

impl StreamListener for ChannelListener {
    fn on_connected(&self) {
        self.forward(StreamNotification::Connected);
    }

    fn on_event(&self, event: &StreamEvent) {
        self.forward(StreamNotification::Event(event.clone()));
    }

    fn on_error(&self, message: &str) {
        self.forward(StreamNotification::Error(message.to_string()));
    }

    fn on_disconnected(&self) {
        self.forward(StreamNotification::Disconnected);
    }

    fn on_state_changed(&self, state: ConnectionState) {
        self.forward(StreamNotification::StateChanged(state));
    }
}
