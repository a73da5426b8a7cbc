//! The uniform contract every transport backend speaks.
//!
//! Each backend runs its event loop in a dedicated tokio task. External code
//! communicates with it through a typed command channel and a shared event
//! channel, keeping the networking layer fully asynchronous and decoupled
//! from the core.

use bytes::Bytes;

/// Connection state of one transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Commands sent *into* a transport task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Publish an opaque payload on a logical channel. Fire-and-forget:
    /// failures are logged inside the backend, never reported back.
    Publish { channel: String, payload: Bytes },
    /// Start receiving payloads published on the given channel.
    Subscribe(String),
    /// Gracefully shut down the backend.
    Shutdown,
}

/// Notifications sent *from* a transport task to the core.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A payload arrived on a subscribed channel.
    Message {
        transport: &'static str,
        channel: String,
        payload: Bytes,
    },
    /// The backend's connection state changed.
    StateChanged {
        transport: &'static str,
        state: ConnectionState,
    },
}
