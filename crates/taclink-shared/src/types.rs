use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, self-assigned identifier of a peer device.
///
/// Generated once at first launch and persisted; treated as an opaque string
/// everywhere else so legacy peers with differently shaped ids keep working.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DeviceAddress(pub String);

impl DeviceAddress {
    /// Generate a fresh random address (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, used as a display fallback when no callsign or
    /// nickname is known for the peer.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The nine domain message kinds carried over the wire.
///
/// Each kind owns one logical channel; acknowledgable kinds own a sibling
/// ack channel. The per-kind wire quirks (historical timestamp field name,
/// per-origin id scoping) live here so the rest of the stack can stay
/// generic over kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Position,
    Pin,
    Profile,
    Chat,
    Order,
    Report,
    Methane,
    Medevac,
    Form,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Position,
        MessageKind::Pin,
        MessageKind::Profile,
        MessageKind::Chat,
        MessageKind::Order,
        MessageKind::Report,
        MessageKind::Methane,
        MessageKind::Medevac,
        MessageKind::Form,
    ];

    /// Logical channel (pub/sub topic suffix) this kind travels on.
    pub fn channel(&self) -> &'static str {
        match self {
            MessageKind::Position => "position",
            MessageKind::Pin => "pin",
            MessageKind::Profile => "profile",
            MessageKind::Chat => "chat",
            MessageKind::Order => "order",
            MessageKind::Report => "report",
            MessageKind::Methane => "methane",
            MessageKind::Medevac => "medevac",
            MessageKind::Form => "form",
        }
    }

    /// Channel carrying DELIVERED/READ acks for this kind, if any.
    pub fn ack_channel(&self) -> Option<&'static str> {
        match self {
            MessageKind::Order => Some("order_ack"),
            MessageKind::Report => Some("report_ack"),
            MessageKind::Methane => Some("methane_ack"),
            MessageKind::Medevac => Some("medevac_ack"),
            MessageKind::Form => Some("form_ack"),
            _ => None,
        }
    }

    /// Whether receipt of this kind must be confirmed with a DELIVERED ack.
    pub fn requires_ack(&self) -> bool {
        self.ack_channel().is_some()
    }

    /// Value of the `type` discriminator on the wire.
    pub fn wire_type(&self) -> &'static str {
        self.channel()
    }

    /// Historical name of the timestamp field this kind emits on the wire.
    /// Inconsistent across kinds; the decoder accepts all three spellings.
    pub fn timestamp_field(&self) -> &'static str {
        match self {
            MessageKind::Position | MessageKind::Pin | MessageKind::Profile => "ts",
            MessageKind::Chat => "timestamp",
            _ => "createdAtMillis",
        }
    }

    /// Whether ids of this kind are only unique per origin device, making
    /// the dedup key the compound `(id, senderDeviceId)`.
    pub fn per_origin_ids(&self) -> bool {
        matches!(self, MessageKind::Pin | MessageKind::Form)
    }

    /// Whether a re-received record with the same dedup key replaces the
    /// stored one (last-write-wins) instead of being ignored.
    pub fn replaces_on_duplicate(&self) -> bool {
        matches!(
            self,
            MessageKind::Pin | MessageKind::Form | MessageKind::Position | MessageKind::Profile
        )
    }

    /// Name of the persisted collection holding this kind's messages.
    pub fn collection(&self) -> &'static str {
        match self {
            MessageKind::Position => "positions",
            MessageKind::Pin => "pins",
            MessageKind::Profile => "profiles",
            MessageKind::Chat => "chat",
            MessageKind::Order => "orders",
            MessageKind::Report => "reports",
            MessageKind::Methane => "methane",
            MessageKind::Medevac => "medevac",
            MessageKind::Form => "forms",
        }
    }
}

/// Channel used to request a bulk re-broadcast of pins from peers.
pub const CHANNEL_PIN_REQ: &str = "pin_req";

/// Channel used to request that peers re-announce their profiles.
pub const CHANNEL_PROFILE_REQ: &str = "profile_req";

/// What an inbound channel name maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRoute {
    /// A domain message of the given kind.
    Message(MessageKind),
    /// An ack for a previously sent message of the given kind.
    Ack(MessageKind),
    /// A bulk pin sync request.
    PinRequest,
    /// A profile re-announcement request.
    ProfileRequest,
}

/// Resolve an inbound channel name to its route, or `None` for channels we
/// do not understand.
pub fn route_channel(channel: &str) -> Option<ChannelRoute> {
    if channel == CHANNEL_PIN_REQ {
        return Some(ChannelRoute::PinRequest);
    }
    if channel == CHANNEL_PROFILE_REQ {
        return Some(ChannelRoute::ProfileRequest);
    }
    for kind in MessageKind::ALL {
        if channel == kind.channel() {
            return Some(ChannelRoute::Message(kind));
        }
        if kind.ack_channel() == Some(channel) {
            return Some(ChannelRoute::Ack(kind));
        }
    }
    None
}
