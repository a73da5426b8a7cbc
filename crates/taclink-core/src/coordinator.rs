//! Delivery coordinator: the inbound half of the messaging core.
//!
//! One long-lived dispatch task consumes the merged event stream of every
//! transport backend. Each inbound payload passes the replay filter, is
//! decoded by the channel's kind, feeds the identity cache, and is routed
//! to the owning domain store; acknowledgable kinds then trigger a
//! DELIVERED ack back to the sender. Every failure on this path is logged
//! and swallowed: one bad payload must never stop processing of the next.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use taclink_net::TransportEvent;
use taclink_shared::types::{route_channel, ChannelRoute, CHANNEL_PIN_REQ, CHANNEL_PROFILE_REQ};
use taclink_shared::protocol::{self, ProfileBody, ProfileKind};
use taclink_shared::{
    now_millis, AckType, Acknowledgment, DeviceAddress, DomainMessage, Kind, MessageKind,
};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::CoreEvent;
use crate::identity::{IdentityRecord, IdentityResolver};
use crate::outbound::OutboundHandle;
use crate::store::DomainStore;
use crate::sync::SyncWindow;

/// Minimal routing result a sink reports back so the coordinator can decide
/// whether to ack.
pub(crate) struct DeliveryReceipt {
    pub sender: DeviceAddress,
    pub message_id: String,
}

/// Inbound consumer for one message kind.
pub(crate) trait InboundSink: Send + Sync {
    /// Decode and store a raw payload of this sink's kind.
    fn deliver(&self, value: serde_json::Value) -> Result<DeliveryReceipt, CoreError>;

    /// Fold an ack into this sink's recipient statuses.
    fn deliver_ack(&self, ack: &Acknowledgment);

    /// Wire-encoded snapshot for bulk re-broadcast; empty by default.
    fn snapshot(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

impl<K: Kind> InboundSink for DomainStore<K> {
    fn deliver(&self, value: serde_json::Value) -> Result<DeliveryReceipt, CoreError> {
        let message = protocol::decode::<K>(value)?;
        let receipt = DeliveryReceipt {
            sender: message.sender_id.clone(),
            message_id: message.id.clone(),
        };
        self.on_received(message);
        Ok(receipt)
    }

    fn deliver_ack(&self, ack: &Acknowledgment) {
        self.on_ack(ack);
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        self.wire_snapshot()
    }
}

/// Sink for `profile` messages: profiles have no domain store of their own,
/// they merge straight into the identity cache.
pub(crate) struct ProfileSink {
    identity: Arc<IdentityResolver>,
}

impl ProfileSink {
    pub(crate) fn new(identity: Arc<IdentityResolver>) -> Self {
        Self { identity }
    }
}

impl InboundSink for ProfileSink {
    fn deliver(&self, value: serde_json::Value) -> Result<DeliveryReceipt, CoreError> {
        let message = protocol::decode::<ProfileKind>(value)?;
        let receipt = DeliveryReceipt {
            sender: message.sender_id.clone(),
            message_id: message.id.clone(),
        };

        let record = IdentityRecord {
            device_id: message.sender_id,
            callsign: message.sender_callsign,
            nickname: message.body.nickname,
            first_name: message.body.first_name,
            last_name: message.body.last_name,
            unit: message.body.unit,
            role: message.body.role,
            last_seen_millis: now_millis(),
            origin_network: None,
        };
        self.identity.merge(record);
        Ok(receipt)
    }

    fn deliver_ack(&self, _ack: &Acknowledgment) {
        debug!("profile channel carries no acks, ignored");
    }
}

/// Routes outbound domain messages and dispatches the merged inbound stream.
pub struct Coordinator {
    config: CoreConfig,
    identity: Arc<IdentityResolver>,
    outbound: OutboundHandle,
    sinks: HashMap<MessageKind, Arc<dyn InboundSink>>,
    pin_gate: SyncWindow,
    events: broadcast::Sender<CoreEvent>,
    /// Last announced local profile, re-broadcast on `profile_req`.
    own_profile: Mutex<Option<ProfileBody>>,
}

impl Coordinator {
    pub(crate) fn new(
        config: CoreConfig,
        identity: Arc<IdentityResolver>,
        outbound: OutboundHandle,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            config,
            identity,
            outbound,
            sinks: HashMap::new(),
            pin_gate: SyncWindow::new(events.clone()),
            events,
            own_profile: Mutex::new(None),
        }
    }

    pub(crate) fn register(&mut self, kind: MessageKind, sink: Arc<dyn InboundSink>) {
        self.sinks.insert(kind, sink);
    }

    /// Dispatch loop over the merged transport event stream. Runs until all
    /// transport event senders are dropped.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message {
                    transport,
                    channel,
                    payload,
                } => {
                    self.handle_inbound(&channel, &payload, transport);
                }
                TransportEvent::StateChanged { transport, state } => {
                    info!(transport, state = ?state, "transport state changed");
                    let _ = self
                        .events
                        .send(CoreEvent::TransportStateChanged { transport, state });
                }
            }
        }
        info!("coordinator dispatch loop terminated");
    }

    /// Process one raw inbound payload. Failures are logged and swallowed.
    pub fn handle_inbound(&self, channel: &str, payload: &[u8], transport: &str) {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(channel, transport, error = %e, "malformed payload, dropped");
                return;
            }
        };

        // Replay filter first: stale traffic is discarded before any
        // further processing, same policy regardless of transport.
        let Some(timestamp) = protocol::peek_timestamp(&value) else {
            debug!(channel, transport, "payload carries no timestamp, dropped");
            return;
        };
        if crate::replay::is_too_old(timestamp, now_millis(), self.config.max_message_age_minutes) {
            debug!(channel, transport, timestamp, "stale payload, dropped");
            return;
        }

        let Some(route) = route_channel(channel) else {
            debug!(channel, transport, "unknown channel, dropped");
            return;
        };

        match route {
            ChannelRoute::Message(kind) => self.handle_message(kind, value, transport),
            ChannelRoute::Ack(kind) => self.handle_ack(kind, value),
            ChannelRoute::PinRequest => self.handle_pin_request(value),
            ChannelRoute::ProfileRequest => self.handle_profile_request(value),
        }
    }

    fn handle_message(&self, kind: MessageKind, value: serde_json::Value, transport: &str) {
        // Identity side-channel: any payload naming its sender advances the
        // identity cache, even before a full profile has arrived.
        if let Some(device) = value.get("deviceId").and_then(|d| d.as_str()) {
            let device = DeviceAddress::from(device);
            if device != self.config.device_id {
                let callsign = value.get("callsign").and_then(|c| c.as_str()).unwrap_or("");
                self.identity.observe(&device, callsign, now_millis());
            }
        }

        if kind == MessageKind::Pin && !self.pin_gate.is_open() {
            // The gate is advisory: unsolicited pins are normal traffic.
            debug!("pin received outside sync window, accepted");
        }

        let Some(sink) = self.sinks.get(&kind) else {
            warn!(kind = ?kind, "no sink registered, dropped");
            return;
        };

        match sink.deliver(value) {
            Ok(receipt) => {
                // Confirm receipt — but never ack your own broadcast echo.
                if kind.requires_ack() && receipt.sender != self.config.device_id {
                    self.outbound.send_ack(
                        kind,
                        &Acknowledgment {
                            message_id: receipt.message_id,
                            from_device: self.config.device_id.clone(),
                            to_device: receipt.sender,
                            ack_type: AckType::Delivered,
                            timestamp_millis: now_millis(),
                        },
                    );
                }
            }
            Err(e) => {
                debug!(kind = ?kind, transport, error = %e, "inbound message rejected, dropped");
            }
        }
    }

    fn handle_ack(&self, kind: MessageKind, value: serde_json::Value) {
        let ack = match protocol::decode_ack(value) {
            Ok(ack) => ack,
            Err(e) => {
                debug!(kind = ?kind, error = %e, "malformed ack, dropped");
                return;
            }
        };

        // Ack channels are shared topics; every peer hears every ack.
        if ack.to_device != self.config.device_id {
            debug!(
                kind = ?kind,
                to = %ack.to_device,
                "ack addressed to another device, ignored"
            );
            return;
        }

        match self.sinks.get(&kind) {
            Some(sink) => sink.deliver_ack(&ack),
            None => warn!(kind = ?kind, "no sink registered for ack, dropped"),
        }
    }

    fn handle_pin_request(&self, value: serde_json::Value) {
        let request = match protocol::decode_request(value) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "malformed pin request, dropped");
                return;
            }
        };
        if request.device_id == self.config.device_id {
            return;
        }

        let Some(pins) = self.sinks.get(&MessageKind::Pin) else {
            return;
        };
        let snapshot = pins.snapshot();
        info!(
            from = %request.device_id,
            pins = snapshot.len(),
            "pin sync requested, re-broadcasting"
        );
        for bytes in snapshot {
            self.outbound.publish(MessageKind::Pin.channel(), bytes);
        }
    }

    fn handle_profile_request(&self, value: serde_json::Value) {
        let request = match protocol::decode_request(value) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "malformed profile request, dropped");
                return;
            }
        };
        if request.device_id == self.config.device_id {
            return;
        }

        let profile = self.own_profile.lock().expect("profile mutex poisoned").clone();
        match profile {
            Some(body) => self.announce_profile(body),
            None => debug!("profile requested but none announced yet"),
        }
    }

    /// Broadcast the local profile and remember it for future
    /// `profile_req` responses.
    pub fn announce_profile(&self, body: ProfileBody) {
        *self.own_profile.lock().expect("profile mutex poisoned") = Some(body.clone());

        let message = DomainMessage::outgoing(
            self.config.device_id.as_str(),
            self.config.device_id.clone(),
            self.config.callsign.clone(),
            Vec::new(),
            now_millis(),
            body,
        );
        match protocol::encode::<ProfileKind>(&message) {
            Ok(bytes) => self.outbound.publish(MessageKind::Profile.channel(), bytes),
            Err(e) => warn!(error = %e, "failed to encode profile announcement"),
        }
    }

    /// Ask peers for a bulk pin re-broadcast and open the sync window.
    pub fn request_pin_sync(&self) {
        match protocol::encode_request(CHANNEL_PIN_REQ, &self.config.device_id, now_millis()) {
            Ok(bytes) => self.outbound.publish(CHANNEL_PIN_REQ, bytes),
            Err(e) => warn!(error = %e, "failed to encode pin sync request"),
        }
        self.pin_gate.open_for(self.config.pin_sync_window);
    }

    /// Close the pin sync window early.
    pub fn stop_pin_sync(&self) {
        self.pin_gate.close();
    }

    /// Ask peers to re-announce their profiles.
    pub fn request_profiles(&self) {
        match protocol::encode_request(CHANNEL_PROFILE_REQ, &self.config.device_id, now_millis()) {
            Ok(bytes) => self.outbound.publish(CHANNEL_PROFILE_REQ, bytes),
            Err(e) => warn!(error = %e, "failed to encode profile request"),
        }
    }

    /// Whether the pin sync window is currently open.
    pub fn pin_sync_open(&self) -> bool {
        self.pin_gate.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use taclink_shared::protocol::{OrderBody, OrderKind, PinBody, PinKind};
    use taclink_shared::Direction;
    use taclink_store::Database;
    use tokio::sync::mpsc;

    use crate::outbound::{outbound_channel, OutboundFrame};

    struct Rig {
        coordinator: Arc<Coordinator>,
        orders: Arc<DomainStore<OrderKind>>,
        pins: Arc<DomainStore<PinKind>>,
        frames: mpsc::Receiver<OutboundFrame>,
    }

    fn rig() -> Rig {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let identity = Arc::new(IdentityResolver::open(db.clone()));
        let (events, _) = broadcast::channel(64);
        let (outbound, frames) = outbound_channel(64);
        let config = CoreConfig::new(DeviceAddress::from("dev-a"), "Alpha-1");

        let orders = DomainStore::<OrderKind>::open(
            db.clone(),
            outbound.clone(),
            identity.clone(),
            events.clone(),
            config.device_id.clone(),
        );
        let pins = DomainStore::<PinKind>::open(
            db.clone(),
            outbound.clone(),
            identity.clone(),
            events.clone(),
            config.device_id.clone(),
        );

        let mut coordinator = Coordinator::new(config, identity, outbound, events);
        coordinator.register(MessageKind::Order, orders.clone());
        coordinator.register(MessageKind::Pin, pins.clone());

        Rig {
            coordinator: Arc::new(coordinator),
            orders,
            pins,
            frames,
        }
    }

    fn order_bytes(id: &str, sender: &str, created_at: i64) -> Vec<u8> {
        let message = DomainMessage::outgoing(
            id,
            DeviceAddress::from(sender),
            "Bravo-2",
            vec![DeviceAddress::from("dev-a")],
            created_at,
            OrderBody {
                title: "Hold".to_string(),
                text: "Hold the line".to_string(),
            },
        );
        protocol::encode::<OrderKind>(&message).unwrap()
    }

    #[tokio::test]
    async fn foreign_order_is_stored_and_delivered_ack_sent() {
        let mut r = rig();
        r.coordinator
            .handle_inbound("order", &order_bytes("41", "dev-b", now_millis()), "udp");

        let stored = r.orders.get("41").unwrap();
        assert_eq!(stored.direction, Direction::Incoming);

        let frame = r.frames.recv().await.unwrap();
        assert_eq!(frame.channel, "order_ack");
        let ack =
            protocol::decode_ack(serde_json::from_slice(&frame.bytes).unwrap()).unwrap();
        assert_eq!(ack.ack_type, AckType::Delivered);
        assert_eq!(ack.message_id, "41");
        assert_eq!(ack.to_device, DeviceAddress::from("dev-b"));
        assert_eq!(ack.from_device, DeviceAddress::from("dev-a"));
    }

    #[tokio::test]
    async fn own_echo_is_never_acked() {
        let mut r = rig();
        r.coordinator
            .handle_inbound("order", &order_bytes("42", "dev-a", now_millis()), "udp");

        assert!(r.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_payload_is_dropped() {
        let r = rig();
        let old = now_millis() - 361 * 60_000;
        r.coordinator
            .handle_inbound("order", &order_bytes("43", "dev-b", old), "mqtt");

        assert!(r.orders.get("43").is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_swallowed() {
        let r = rig();
        r.coordinator.handle_inbound("order", b"\x00garbage", "udp");
        r.coordinator
            .handle_inbound("order", br#"{"type":"order"}"#, "udp");
        assert!(r.orders.all().is_empty());
    }

    #[tokio::test]
    async fn foreign_addressed_ack_is_ignored() {
        let r = rig();
        let ack = Acknowledgment {
            message_id: "41".to_string(),
            from_device: DeviceAddress::from("dev-c"),
            to_device: DeviceAddress::from("dev-b"),
            ack_type: AckType::Delivered,
            timestamp_millis: now_millis(),
        };
        let bytes = protocol::encode_ack(&ack).unwrap();
        r.coordinator.handle_inbound("order_ack", &bytes, "mqtt");

        assert!(r.orders.statuses_for("41").is_empty());
    }

    #[tokio::test]
    async fn inbound_message_feeds_identity_cache() {
        let r = rig();
        r.coordinator
            .handle_inbound("order", &order_bytes("44", "dev-b", now_millis()), "udp");

        assert_eq!(
            r.coordinator.identity.display_name(&DeviceAddress::from("dev-b")),
            "Bravo-2"
        );
    }

    #[tokio::test]
    async fn pin_request_rebroadcasts_held_pins() {
        let mut r = rig();
        let pin = DomainMessage::outgoing(
            "p1",
            DeviceAddress::from("dev-a"),
            "Alpha-1",
            Vec::new(),
            now_millis(),
            PinBody {
                lat: 59.4,
                lon: 24.7,
                title: "OP".to_string(),
                description: None,
                color: None,
            },
        );
        r.pins.send(pin);
        let _send_frame = r.frames.recv().await.unwrap();

        let req = protocol::encode_request(
            CHANNEL_PIN_REQ,
            &DeviceAddress::from("dev-b"),
            now_millis(),
        )
        .unwrap();
        r.coordinator.handle_inbound(CHANNEL_PIN_REQ, &req, "udp");

        let frame = r.frames.recv().await.unwrap();
        assert_eq!(frame.channel, "pin");
        let value: serde_json::Value = serde_json::from_slice(&frame.bytes).unwrap();
        assert_eq!(value["id"], "p1");
    }

    #[tokio::test]
    async fn own_pin_request_is_ignored() {
        let mut r = rig();
        let req = protocol::encode_request(
            CHANNEL_PIN_REQ,
            &DeviceAddress::from("dev-a"),
            now_millis(),
        )
        .unwrap();
        r.coordinator.handle_inbound(CHANNEL_PIN_REQ, &req, "udp");
        assert!(r.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn pins_are_accepted_outside_sync_window() {
        let r = rig();
        assert!(!r.coordinator.pin_sync_open());

        let pin = DomainMessage::outgoing(
            "p2",
            DeviceAddress::from("dev-b"),
            "Bravo-2",
            Vec::new(),
            now_millis(),
            PinBody {
                lat: 1.0,
                lon: 2.0,
                title: "unsolicited".to_string(),
                description: None,
                color: None,
            },
        );
        let bytes = protocol::encode::<PinKind>(&pin).unwrap();
        r.coordinator.handle_inbound("pin", &bytes, "udp");

        // Permissive gate: the pin lands even though no sync was requested.
        assert_eq!(r.pins.all().len(), 1);
    }
}
