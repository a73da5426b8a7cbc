//! Core event notifications for UI-layer subscribers.
//!
//! Delivered over a `tokio::sync::broadcast` channel so any number of
//! observers (screens, tests) can attach and detach freely. Events are
//! change notifications only; the stores remain the source of truth.

use taclink_shared::{AckType, DeviceAddress, MessageKind};
use taclink_net::ConnectionState;

/// Capacity of the broadcast channel; lagging subscribers drop the oldest
/// events rather than blocking the core.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A new (non-duplicate) message was stored.
    MessageReceived {
        kind: MessageKind,
        message_id: String,
        sender: DeviceAddress,
    },
    /// An ack updated a recipient status of an outgoing message.
    AckApplied {
        kind: MessageKind,
        message_id: String,
        recipient: DeviceAddress,
        ack_type: AckType,
    },
    /// A transport backend's connection state changed.
    TransportStateChanged {
        transport: &'static str,
        state: ConnectionState,
    },
    /// The pin sync window opened (an explicit sync request went out).
    PinSyncOpened,
    /// The pin sync window closed (timeout or explicit stop).
    PinSyncClosed,
}
