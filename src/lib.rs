//! Realtime security event stream client for the i4ops dashboard.
//!
//! The crate is organized by transport surface:
//! - `stream`: connection handle, state machine, frames and filters.
//! - `transport`: SSE and websocket push channels.
//! - `retry`: reconnect budget, backoff and timeout utilities.

/// Reconnect policy and timeout helpers.
pub mod retry;
/// Realtime stream client, protocol types, and session state.
pub mod stream;
/// Server-push transports used by the stream worker.
pub mod transport;

pub use stream::client::{
    StreamClient, StreamClientError, StreamConnection, StreamDefaults, StreamOptions,
};
pub use stream::filters::SubscriptionFilters;
pub use stream::listener::{ChannelListener, NoopListener, StreamListener, StreamNotification};
pub use stream::proto::{Severity, StreamEvent, StreamMessage};
pub use stream::session::{ConnectionState, StreamSnapshot};
