//! Domain message model: the common attributes every kind shares, the
//! per-recipient delivery tracking record, and the ack message folded into it.

use serde::{Deserialize, Serialize};

use crate::types::DeviceAddress;

/// Whether a message was authored locally or received from a peer.
/// Assigned at creation and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Acknowledgment level confirmed by a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckType {
    Delivered,
    Read,
}

/// A domain message of one kind, common envelope plus kind-specific body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainMessage<B> {
    /// Caller-assigned id, unique within kind and sender. Kinds with
    /// per-origin ids are deduplicated on `(id, sender_id)` instead.
    pub id: String,
    pub created_at_millis: i64,
    pub sender_id: DeviceAddress,
    /// Denormalized snapshot of the sender's callsign at send time; may be
    /// stale relative to the identity cache.
    pub sender_callsign: String,
    /// Empty means broadcast/unaddressed (pins, positions, profiles).
    pub recipients: Vec<DeviceAddress>,
    pub direction: Direction,
    pub is_read: bool,
    pub body: B,
}

impl<B> DomainMessage<B> {
    /// Build a locally authored message. Outgoing messages are born read.
    pub fn outgoing(
        id: impl Into<String>,
        sender_id: DeviceAddress,
        sender_callsign: impl Into<String>,
        recipients: Vec<DeviceAddress>,
        created_at_millis: i64,
        body: B,
    ) -> Self {
        Self {
            id: id.into(),
            created_at_millis,
            sender_id,
            sender_callsign: sender_callsign.into(),
            recipients,
            direction: Direction::Outgoing,
            is_read: true,
            body,
        }
    }
}

/// Delivery state of one outgoing message for one recipient.
///
/// `sent_at_millis` is immutable after creation; the two ack timestamps are
/// each set at most once and never regressed. A READ ack is accepted without
/// a prior DELIVERED ack (the DELIVERED ack may simply have been lost).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub message_id: String,
    pub recipient_id: DeviceAddress,
    /// Resolved at creation from the identity cache; empty when unknown.
    pub recipient_callsign: String,
    pub sent_at_millis: i64,
    pub delivered_at_millis: Option<i64>,
    pub read_at_millis: Option<i64>,
}

impl RecipientStatus {
    pub fn new(
        message_id: impl Into<String>,
        recipient_id: DeviceAddress,
        recipient_callsign: impl Into<String>,
        sent_at_millis: i64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            recipient_id,
            recipient_callsign: recipient_callsign.into(),
            sent_at_millis,
            delivered_at_millis: None,
            read_at_millis: None,
        }
    }

    /// Fold an ack into this record. First ack of each type wins; repeats
    /// and out-of-order arrivals are no-ops on already-set fields.
    pub fn apply_ack(&mut self, ack_type: AckType, timestamp_millis: i64) {
        let slot = match ack_type {
            AckType::Delivered => &mut self.delivered_at_millis,
            AckType::Read => &mut self.read_at_millis,
        };
        if slot.is_none() {
            *slot = Some(timestamp_millis);
        }
    }
}

/// Wire-level acknowledgment. Transient: never persisted as its own entity,
/// only folded into the matching [`RecipientStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgment {
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// The device acking, i.e. the recipient of the original message.
    #[serde(rename = "fromDeviceId")]
    pub from_device: DeviceAddress,
    /// The original sender the ack is addressed to.
    #[serde(rename = "toDeviceId")]
    pub to_device: DeviceAddress,
    #[serde(rename = "ackType")]
    pub ack_type: AckType,
    #[serde(
        rename = "timestamp",
        alias = "ts",
        alias = "createdAtMillis"
    )]
    pub timestamp_millis: i64,
}
