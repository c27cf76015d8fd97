//! Realtime stream modules.
//!
//! - `client`: entry point, options and the non-blocking connection handle.
//! - `session`: the worker task that runs the reconnect state machine.
//! - `proto`: wire frames and typed security event payloads.
//! - `filters`: subscription filters and query construction.
//! - `buffer`: bounded recent event buffer.
//! - `listener`: lifecycle callbacks.

/// Stream client, options and connection handle.
pub mod client;
/// Recent event buffer.
pub mod buffer;
/// Subscription filters.
pub mod filters;
/// Lifecycle and event callbacks.
pub mod listener;
/// Stream protocol messages.
pub mod proto;
/// Connection worker and observable state.
pub mod session;
