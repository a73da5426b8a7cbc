//! Node: the composition root wiring stores, identity, coordinator and
//! transports into one running messaging core.
//!
//! The embedding application owns transport construction: it creates the
//! shared event channel with [`transport_channel`], spawns whichever
//! backends it wants (MQTT, UDP broadcast, both) against the sender side,
//! and hands the command senders plus the receiver to [`Node::spawn`].

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use taclink_net::{TransportCommand, TransportEvent};
use taclink_shared::protocol::{
    ChatKind, FormKind, MedevacKind, MethaneKind, OrderKind, PinKind, PositionKind, ProfileBody,
    PositionBody, ReportKind,
};
use taclink_shared::types::{CHANNEL_PIN_REQ, CHANNEL_PROFILE_REQ};
use taclink_shared::{now_millis, DomainMessage, MessageKind};
use taclink_store::Database;

use crate::config::CoreConfig;
use crate::coordinator::{Coordinator, ProfileSink};
use crate::events::{CoreEvent, EVENT_CHANNEL_CAPACITY};
use crate::identity::IdentityResolver;
use crate::outbound::spawn_outbound;
use crate::store::DomainStore;

/// Build the shared transport event channel every backend publishes into.
pub fn transport_channel() -> (mpsc::Sender<TransportEvent>, mpsc::Receiver<TransportEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// A running messaging core: one store per kind, the identity cache, and
/// the coordinator task dispatching the merged inbound stream.
pub struct Node {
    config: CoreConfig,
    pub identity: Arc<IdentityResolver>,
    pub positions: Arc<DomainStore<PositionKind>>,
    pub pins: Arc<DomainStore<PinKind>>,
    pub chat: Arc<DomainStore<ChatKind>>,
    pub orders: Arc<DomainStore<OrderKind>>,
    pub reports: Arc<DomainStore<ReportKind>>,
    pub methane: Arc<DomainStore<MethaneKind>>,
    pub medevac: Arc<DomainStore<MedevacKind>>,
    pub forms: Arc<DomainStore<FormKind>>,
    coordinator: Arc<Coordinator>,
    events: broadcast::Sender<CoreEvent>,
}

impl Node {
    /// Wire up and start the core.
    ///
    /// `transports` are the command queues of already-spawned backends;
    /// `inbound` is the receiver side of [`transport_channel`]. Every kind,
    /// ack and request channel is subscribed on every backend, and the
    /// coordinator dispatch task is spawned before returning.
    pub fn spawn(
        config: CoreConfig,
        db: Arc<Database>,
        transports: Vec<mpsc::Sender<TransportCommand>>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let outbound = spawn_outbound(transports.clone());
        let identity = Arc::new(IdentityResolver::open(db.clone()));

        macro_rules! open_store {
            ($kind:ty) => {
                DomainStore::<$kind>::open(
                    db.clone(),
                    outbound.clone(),
                    identity.clone(),
                    events.clone(),
                    config.device_id.clone(),
                )
            };
        }

        let positions = open_store!(PositionKind);
        let pins = open_store!(PinKind);
        let chat = open_store!(ChatKind);
        let orders = open_store!(OrderKind);
        let reports = open_store!(ReportKind);
        let methane = open_store!(MethaneKind);
        let medevac = open_store!(MedevacKind);
        let forms = open_store!(FormKind);

        let mut coordinator = Coordinator::new(
            config.clone(),
            identity.clone(),
            outbound,
            events.clone(),
        );
        coordinator.register(MessageKind::Position, positions.clone());
        coordinator.register(MessageKind::Pin, pins.clone());
        coordinator.register(MessageKind::Chat, chat.clone());
        coordinator.register(MessageKind::Order, orders.clone());
        coordinator.register(MessageKind::Report, reports.clone());
        coordinator.register(MessageKind::Methane, methane.clone());
        coordinator.register(MessageKind::Medevac, medevac.clone());
        coordinator.register(MessageKind::Form, forms.clone());
        coordinator.register(
            MessageKind::Profile,
            Arc::new(ProfileSink::new(identity.clone())),
        );
        let coordinator = Arc::new(coordinator);

        subscribe_all(&transports);
        tokio::spawn(coordinator.clone().run(inbound));
        info!(device = %config.device_id, transports = transports.len(), "node started");

        Self {
            config,
            identity,
            positions,
            pins,
            chat,
            orders,
            reports,
            methane,
            medevac,
            forms,
            coordinator,
            events,
        }
    }

    pub fn device_id(&self) -> &taclink_shared::DeviceAddress {
        &self.config.device_id
    }

    /// Subscribe to core change notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Broadcast the local operator's profile.
    pub fn announce_profile(&self, body: ProfileBody) {
        self.coordinator.announce_profile(body);
    }

    /// Broadcast the local position beacon. Keyed by device id so peers
    /// keep only the latest fix per device.
    pub fn announce_position(&self, body: PositionBody) {
        self.positions.send(DomainMessage::outgoing(
            self.config.device_id.as_str(),
            self.config.device_id.clone(),
            self.config.callsign.clone(),
            Vec::new(),
            now_millis(),
            body,
        ));
    }

    /// Ask peers for a bulk pin re-broadcast; opens the sync window.
    pub fn request_pin_sync(&self) {
        self.coordinator.request_pin_sync();
    }

    /// Close the pin sync window early.
    pub fn stop_pin_sync(&self) {
        self.coordinator.stop_pin_sync();
    }

    /// Ask peers to re-announce their profiles.
    pub fn request_profiles(&self) {
        self.coordinator.request_profiles();
    }

    /// Whether the pin sync window is currently open.
    pub fn pin_sync_open(&self) -> bool {
        self.coordinator.pin_sync_open()
    }
}

fn subscribe_all(transports: &[mpsc::Sender<TransportCommand>]) {
    for transport in transports {
        let mut channels: Vec<String> = Vec::new();
        for kind in MessageKind::ALL {
            channels.push(kind.channel().to_string());
            if let Some(ack) = kind.ack_channel() {
                channels.push(ack.to_string());
            }
        }
        channels.push(CHANNEL_PIN_REQ.to_string());
        channels.push(CHANNEL_PROFILE_REQ.to_string());

        for channel in channels {
            if transport
                .try_send(TransportCommand::Subscribe(channel.clone()))
                .is_err()
            {
                warn!(channel = %channel, "transport rejected subscription");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use taclink_shared::protocol::OrderBody;
    use taclink_shared::{DeviceAddress, Direction};

    /// In-process transport: everything published by one node is delivered
    /// straight into the other node's event stream.
    fn loopback_to(peer: mpsc::Sender<TransportEvent>) -> mpsc::Sender<TransportCommand> {
        let (tx, mut rx) = mpsc::channel::<TransportCommand>(64);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let TransportCommand::Publish { channel, payload } = cmd {
                    let _ = peer
                        .send(TransportEvent::Message {
                            transport: "loopback",
                            channel,
                            payload,
                        })
                        .await;
                }
            }
        });
        tx
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 2s");
    }

    #[tokio::test]
    async fn order_round_trip_with_delivered_and_read_acks() {
        let (a_inbound_tx, a_inbound_rx) = transport_channel();
        let (b_inbound_tx, b_inbound_rx) = transport_channel();

        let db_a = Arc::new(Database::open_in_memory().unwrap());
        let db_b = Arc::new(Database::open_in_memory().unwrap());

        // A publishes into B's inbound stream and vice versa.
        let node_a = Node::spawn(
            CoreConfig::new(DeviceAddress::from("dev-a"), "Alpha-1"),
            db_a,
            vec![loopback_to(b_inbound_tx)],
            a_inbound_rx,
        );
        let node_b = Node::spawn(
            CoreConfig::new(DeviceAddress::from("dev-b"), "Bravo-2"),
            db_b,
            vec![loopback_to(a_inbound_tx)],
            b_inbound_rx,
        );

        let order = DomainMessage::outgoing(
            "41",
            node_a.device_id().clone(),
            "Alpha-1",
            vec![node_b.device_id().clone()],
            now_millis(),
            OrderBody {
                title: "Move to RV".to_string(),
                text: "Depart at 1430".to_string(),
            },
        );
        node_a.orders.send(order);

        // B stores the order and A sees the automatic DELIVERED ack.
        wait_until(|| node_b.orders.get("41").is_some()).await;
        let received = node_b.orders.get("41").unwrap();
        assert_eq!(received.direction, Direction::Incoming);
        assert!(!received.is_read);

        wait_until(|| {
            node_a
                .orders
                .statuses_for("41")
                .first()
                .map(|s| s.delivered_at_millis.is_some())
                .unwrap_or(false)
        })
        .await;

        // B reads the order; A sees the READ ack land on the same status.
        assert!(node_b.orders.mark_read("41"));
        wait_until(|| {
            node_a
                .orders
                .statuses_for("41")
                .first()
                .map(|s| s.read_at_millis.is_some())
                .unwrap_or(false)
        })
        .await;

        let status = &node_a.orders.statuses_for("41")[0];
        assert_eq!(status.recipient_id, DeviceAddress::from("dev-b"));
        assert!(status.delivered_at_millis.is_some());
        assert!(status.read_at_millis.is_some());
    }

    #[tokio::test]
    async fn profile_announcement_reaches_peer_identity_cache() {
        let (a_inbound_tx, a_inbound_rx) = transport_channel();
        let (b_inbound_tx, b_inbound_rx) = transport_channel();

        let node_a = Node::spawn(
            CoreConfig::new(DeviceAddress::from("dev-a"), "Alpha-1"),
            Arc::new(Database::open_in_memory().unwrap()),
            vec![loopback_to(b_inbound_tx)],
            a_inbound_rx,
        );
        let node_b = Node::spawn(
            CoreConfig::new(DeviceAddress::from("dev-b"), "Bravo-2"),
            Arc::new(Database::open_in_memory().unwrap()),
            vec![loopback_to(a_inbound_tx)],
            b_inbound_rx,
        );

        node_a.announce_profile(ProfileBody {
            nickname: "Sam".to_string(),
            unit: "2nd Platoon".to_string(),
            role: "medic".to_string(),
            ..Default::default()
        });

        wait_until(|| {
            node_b
                .identity
                .lookup(&DeviceAddress::from("dev-a"))
                .map(|r| r.role == "medic")
                .unwrap_or(false)
        })
        .await;

        assert_eq!(
            node_b.identity.display_name(&DeviceAddress::from("dev-a")),
            "Alpha-1"
        );
    }

    #[tokio::test]
    async fn late_joiner_pulls_pins_via_sync_request() {
        use taclink_shared::protocol::PinBody;

        let (a_inbound_tx, a_inbound_rx) = transport_channel();
        let (b_inbound_tx, b_inbound_rx) = transport_channel();
        let (c_inbound_tx, c_inbound_rx) = transport_channel();

        // B's second transport leg; forwarding towards C starts only once
        // C has joined, and pre-join traffic is discarded.
        let (b_to_c_tx, mut b_to_c_rx) = mpsc::channel::<TransportCommand>(64);

        let node_a = Node::spawn(
            CoreConfig::new(DeviceAddress::from("dev-a"), "Alpha-1"),
            Arc::new(Database::open_in_memory().unwrap()),
            vec![loopback_to(b_inbound_tx.clone())],
            a_inbound_rx,
        );
        let node_b = Node::spawn(
            CoreConfig::new(DeviceAddress::from("dev-b"), "Bravo-2"),
            Arc::new(Database::open_in_memory().unwrap()),
            vec![loopback_to(a_inbound_tx), b_to_c_tx],
            b_inbound_rx,
        );

        node_b.pins.send(DomainMessage::outgoing(
            "p1",
            node_b.device_id().clone(),
            "Bravo-2",
            Vec::new(),
            now_millis(),
            PinBody {
                lat: 59.43,
                lon: 24.75,
                title: "OP north".to_string(),
                description: None,
                color: None,
            },
        ));
        wait_until(|| node_a.pins.get("p1").is_some()).await;

        // C joins late on a fresh database and missed the broadcast.
        while b_to_c_rx.try_recv().is_ok() {}
        tokio::spawn(async move {
            while let Some(cmd) = b_to_c_rx.recv().await {
                if let TransportCommand::Publish { channel, payload } = cmd {
                    let _ = c_inbound_tx
                        .send(TransportEvent::Message {
                            transport: "loopback",
                            channel,
                            payload,
                        })
                        .await;
                }
            }
        });
        let node_c = Node::spawn(
            CoreConfig::new(DeviceAddress::from("dev-c"), "Charlie-3"),
            Arc::new(Database::open_in_memory().unwrap()),
            vec![loopback_to(b_inbound_tx)],
            c_inbound_rx,
        );
        assert!(node_c.pins.get("p1").is_none());

        // An explicit sync request pulls the held pin from B.
        node_c.request_pin_sync();
        assert!(node_c.pin_sync_open());
        wait_until(|| node_c.pins.get("p1").is_some()).await;
    }
}
