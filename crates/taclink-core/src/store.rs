//! Generic per-kind domain store.
//!
//! One [`DomainStore`] instance owns the in-memory and persisted list of a
//! single message kind plus its recipient status records. All mutation is
//! serialized behind the store's mutex (single-writer-per-store); every
//! mutation rewrites the persisted collections wholesale. Persistence
//! failures are logged and swallowed so the running session stays
//! consistent even if durability is temporarily lost.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use taclink_shared::{
    now_millis, protocol, AckType, Acknowledgment, DeviceAddress, Direction, DomainMessage, Kind,
    RecipientStatus,
};
use taclink_store::Database;

use crate::events::CoreEvent;
use crate::identity::IdentityResolver;
use crate::outbound::OutboundHandle;

/// What happened to a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// New key, appended.
    Added,
    /// Known key, record replaced (last-write-wins kinds).
    Replaced,
    /// Known key, ignored.
    Duplicate,
}

struct Inner<K: Kind> {
    messages: Vec<DomainMessage<K::Body>>,
    statuses: Vec<RecipientStatus>,
}

/// The store for one message kind.
pub struct DomainStore<K: Kind> {
    inner: Mutex<Inner<K>>,
    db: Arc<Database>,
    outbound: OutboundHandle,
    identity: Arc<IdentityResolver>,
    events: broadcast::Sender<CoreEvent>,
    local_device: DeviceAddress,
}

impl<K: Kind> DomainStore<K> {
    /// Load the persisted collections for this kind; unreadable collections
    /// start the session empty.
    pub fn open(
        db: Arc<Database>,
        outbound: OutboundHandle,
        identity: Arc<IdentityResolver>,
        events: broadcast::Sender<CoreEvent>,
        local_device: DeviceAddress,
    ) -> Arc<Self> {
        let messages = db
            .load_collection(K::KIND.collection())
            .unwrap_or_else(|e| {
                warn!(kind = ?K::KIND, error = %e, "failed to load messages, starting empty");
                Vec::new()
            });
        let statuses = db
            .load_collection(&Self::status_collection())
            .unwrap_or_else(|e| {
                warn!(kind = ?K::KIND, error = %e, "failed to load statuses, starting empty");
                Vec::new()
            });

        Arc::new(Self {
            inner: Mutex::new(Inner { messages, statuses }),
            db,
            outbound,
            identity,
            events,
            local_device,
        })
    }

    fn status_collection() -> String {
        format!("{}_status", K::KIND.collection())
    }

    /// Send a locally authored message.
    ///
    /// Persists it, creates one recipient status per declared recipient
    /// (none for an empty list — unaddressed kinds reuse this path), then
    /// broadcasts on the kind's channel. Fire-and-forget: network failures
    /// never reach the caller and the local copy is kept regardless.
    pub fn send(&self, message: DomainMessage<K::Body>) {
        let sent_at = now_millis();
        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            for recipient in &message.recipients {
                inner.statuses.push(RecipientStatus::new(
                    message.id.clone(),
                    recipient.clone(),
                    self.identity.callsign_or_empty(recipient),
                    sent_at,
                ));
            }
            inner.messages.push(message.clone());
            self.persist(&inner);
        }

        match protocol::encode::<K>(&message) {
            Ok(bytes) => self.outbound.publish(K::KIND.channel(), bytes),
            Err(e) => {
                // Local copy is already persisted; only the broadcast is lost.
                warn!(kind = ?K::KIND, id = %message.id, error = %e, "encode failed, send skipped")
            }
        }
    }

    /// Fold an inbound message into the store. Idempotent under duplicate
    /// delivery across transports.
    pub fn on_received(&self, message: DomainMessage<K::Body>) -> ReceiveOutcome {
        let outcome = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            let existing = inner
                .messages
                .iter()
                .position(|m| Self::same_key(m, &message));

            match existing {
                None => {
                    inner.messages.push(message.clone());
                    self.persist(&inner);
                    ReceiveOutcome::Added
                }
                Some(index) if K::KIND.replaces_on_duplicate() => {
                    // Last-write-wins on content, but a record's direction
                    // and read flag are local state and survive the
                    // overwrite (a device hearing its own broadcast echoed
                    // back must not flip an outgoing record to incoming).
                    let mut replacement = message.clone();
                    replacement.direction = inner.messages[index].direction;
                    replacement.is_read = inner.messages[index].is_read;
                    inner.messages[index] = replacement;
                    self.persist(&inner);
                    ReceiveOutcome::Replaced
                }
                Some(_) => ReceiveOutcome::Duplicate,
            }
        };

        match outcome {
            ReceiveOutcome::Duplicate => {
                debug!(kind = ?K::KIND, id = %message.id, "duplicate receipt ignored");
            }
            _ => {
                let _ = self.events.send(CoreEvent::MessageReceived {
                    kind: K::KIND,
                    message_id: message.id.clone(),
                    sender: message.sender_id.clone(),
                });
            }
        }
        outcome
    }

    /// Mark a message read. The false→true transition happens at most once
    /// and, for incoming messages of acknowledgable kinds, emits exactly
    /// one READ ack back to the original sender.
    ///
    /// Kinds with per-origin ids should use [`Self::mark_read_from`] to
    /// disambiguate between senders sharing an id.
    pub fn mark_read(&self, id: &str) -> bool {
        self.mark_read_matching(id, None)
    }

    /// Mark read by the full `(id, origin)` key.
    pub fn mark_read_from(&self, id: &str, origin: &DeviceAddress) -> bool {
        self.mark_read_matching(id, Some(origin))
    }

    fn mark_read_matching(&self, id: &str, origin: Option<&DeviceAddress>) -> bool {
        let ack_target = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            let Some(index) = Self::find(&inner, id, origin) else {
                return false;
            };
            let target = {
                let message = &mut inner.messages[index];
                if message.is_read {
                    return false;
                }
                message.is_read = true;
                (message.direction == Direction::Incoming)
                    .then(|| (message.id.clone(), message.sender_id.clone()))
            };
            self.persist(&inner);
            target
        };

        if let Some((message_id, sender)) = ack_target {
            if K::KIND.requires_ack() {
                self.outbound.send_ack(
                    K::KIND,
                    &Acknowledgment {
                        message_id,
                        from_device: self.local_device.clone(),
                        to_device: sender,
                        ack_type: AckType::Read,
                        timestamp_millis: now_millis(),
                    },
                );
            }
        }
        true
    }

    /// Fold an inbound ack into the matching recipient status.
    ///
    /// An ack for an unknown status synthesizes one defensively (the
    /// message may have been sent before a restart, or by a legacy sender);
    /// its sent time is backfilled with "now", the best available
    /// approximation. Already-set timestamps are never regressed.
    pub fn on_ack(&self, ack: &Acknowledgment) {
        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            let position = inner
                .statuses
                .iter()
                .position(|s| s.message_id == ack.message_id && s.recipient_id == ack.from_device);

            let index = match position {
                Some(i) => i,
                None => {
                    debug!(
                        kind = ?K::KIND,
                        message_id = %ack.message_id,
                        from = %ack.from_device,
                        "ack for unknown status, synthesizing record"
                    );
                    inner.statuses.push(RecipientStatus::new(
                        ack.message_id.clone(),
                        ack.from_device.clone(),
                        self.identity.callsign_or_empty(&ack.from_device),
                        now_millis(),
                    ));
                    inner.statuses.len() - 1
                }
            };

            inner.statuses[index].apply_ack(ack.ack_type, ack.timestamp_millis);
            self.persist(&inner);
        }

        let _ = self.events.send(CoreEvent::AckApplied {
            kind: K::KIND,
            message_id: ack.message_id.clone(),
            recipient: ack.from_device.clone(),
            ack_type: ack.ack_type,
        });
    }

    /// Remove a message and its recipient statuses. Kinds with per-origin
    /// ids should use [`Self::delete_from`].
    pub fn delete(&self, id: &str) -> bool {
        self.delete_matching(id, None)
    }

    /// Remove by the full `(id, origin)` key.
    pub fn delete_from(&self, id: &str, origin: &DeviceAddress) -> bool {
        self.delete_matching(id, Some(origin))
    }

    fn delete_matching(&self, id: &str, origin: Option<&DeviceAddress>) -> bool {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let Some(index) = Self::find(&inner, id, origin) else {
            return false;
        };
        inner.messages.remove(index);
        // Statuses carry no origin; drop them only once no record with this
        // id remains.
        if !inner.messages.iter().any(|m| m.id == id) {
            inner.statuses.retain(|s| s.message_id != id);
        }
        self.persist(&inner);
        true
    }

    /// Lookup by id. Kinds with per-origin ids should use
    /// [`Self::get_from`]; a bare id resolves to the first match.
    pub fn get(&self, id: &str) -> Option<DomainMessage<K::Body>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Self::find(&inner, id, None).map(|i| inner.messages[i].clone())
    }

    /// Lookup by the full `(id, origin)` key.
    pub fn get_from(&self, id: &str, origin: &DeviceAddress) -> Option<DomainMessage<K::Body>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Self::find(&inner, id, Some(origin)).map(|i| inner.messages[i].clone())
    }

    /// All messages, newest first.
    pub fn all(&self) -> Vec<DomainMessage<K::Body>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut list = inner.messages.clone();
        list.sort_by(|a, b| b.created_at_millis.cmp(&a.created_at_millis));
        list
    }

    /// Received messages, newest first.
    pub fn incoming(&self) -> Vec<DomainMessage<K::Body>> {
        self.filtered(Direction::Incoming)
    }

    /// Locally authored messages, newest first.
    pub fn outgoing(&self) -> Vec<DomainMessage<K::Body>> {
        self.filtered(Direction::Outgoing)
    }

    fn filtered(&self, direction: Direction) -> Vec<DomainMessage<K::Body>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut list: Vec<_> = inner
            .messages
            .iter()
            .filter(|m| m.direction == direction)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at_millis.cmp(&a.created_at_millis));
        list
    }

    /// Count of unread incoming messages.
    pub fn unread_count(&self) -> usize {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .messages
            .iter()
            .filter(|m| m.direction == Direction::Incoming && !m.is_read)
            .count()
    }

    /// Recipient statuses of one outgoing message.
    pub fn statuses_for(&self, message_id: &str) -> Vec<RecipientStatus> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .statuses
            .iter()
            .filter(|s| s.message_id == message_id)
            .cloned()
            .collect()
    }

    /// Wire-encoded snapshot of every held message, for bulk re-broadcast
    /// in response to a sync request.
    pub fn wire_snapshot(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .messages
            .iter()
            .filter_map(|m| match protocol::encode::<K>(m) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(kind = ?K::KIND, id = %m.id, error = %e, "snapshot encode failed");
                    None
                }
            })
            .collect()
    }

    fn same_key(a: &DomainMessage<K::Body>, b: &DomainMessage<K::Body>) -> bool {
        // Ids of some kinds are only unique per origin device.
        a.id == b.id && (!K::KIND.per_origin_ids() || a.sender_id == b.sender_id)
    }

    fn find(inner: &Inner<K>, id: &str, origin: Option<&DeviceAddress>) -> Option<usize> {
        inner.messages.iter().position(|m| {
            m.id == id
                && match origin {
                    Some(origin) => m.sender_id == *origin,
                    None => true,
                }
        })
    }

    fn persist(&self, inner: &Inner<K>) {
        if let Err(e) = self.db.save_collection(K::KIND.collection(), &inner.messages) {
            warn!(kind = ?K::KIND, error = %e, "failed to persist messages");
        }
        if let Err(e) = self
            .db
            .save_collection(&Self::status_collection(), &inner.statuses)
        {
            warn!(kind = ?K::KIND, error = %e, "failed to persist statuses");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taclink_shared::protocol::{OrderBody, OrderKind, PinBody, PinKind};
    use tokio::sync::mpsc;

    use crate::outbound::{outbound_channel, OutboundFrame};

    struct Fixture {
        db: Arc<Database>,
        identity: Arc<IdentityResolver>,
        events: broadcast::Sender<CoreEvent>,
        frames: mpsc::Receiver<OutboundFrame>,
        outbound: OutboundHandle,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let identity = Arc::new(IdentityResolver::open(db.clone()));
        let (events, _) = broadcast::channel(64);
        let (outbound, frames) = outbound_channel(64);
        Fixture {
            db,
            identity,
            events,
            frames,
            outbound,
        }
    }

    fn order_store(f: &Fixture) -> Arc<DomainStore<OrderKind>> {
        DomainStore::<OrderKind>::open(
            f.db.clone(),
            f.outbound.clone(),
            f.identity.clone(),
            f.events.clone(),
            DeviceAddress::from("dev-a"),
        )
    }

    fn incoming_order(id: &str, sender: &str) -> DomainMessage<OrderBody> {
        DomainMessage {
            id: id.to_string(),
            created_at_millis: 1_000,
            sender_id: DeviceAddress::from(sender),
            sender_callsign: "Bravo-2".to_string(),
            recipients: vec![DeviceAddress::from("dev-a")],
            direction: Direction::Incoming,
            is_read: false,
            body: OrderBody {
                title: "Hold".to_string(),
                text: "Hold the line".to_string(),
            },
        }
    }

    #[test]
    fn duplicate_receipt_is_idempotent() {
        let f = fixture();
        let store = order_store(&f);

        assert_eq!(
            store.on_received(incoming_order("41", "dev-b")),
            ReceiveOutcome::Added
        );
        assert_eq!(
            store.on_received(incoming_order("41", "dev-b")),
            ReceiveOutcome::Duplicate
        );
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn pins_dedup_on_compound_key_and_replace() {
        let f = fixture();
        let store = DomainStore::<PinKind>::open(
            f.db.clone(),
            f.outbound.clone(),
            f.identity.clone(),
            f.events.clone(),
            DeviceAddress::from("dev-a"),
        );

        let pin = |sender: &str, title: &str| DomainMessage {
            id: "p1".to_string(),
            created_at_millis: 1_000,
            sender_id: DeviceAddress::from(sender),
            sender_callsign: String::new(),
            recipients: Vec::new(),
            direction: Direction::Incoming,
            is_read: false,
            body: PinBody {
                lat: 1.0,
                lon: 2.0,
                title: title.to_string(),
                description: None,
                color: None,
            },
        };

        // Same id from two origins: two distinct records.
        store.on_received(pin("dev-b", "OP north"));
        store.on_received(pin("dev-c", "OP south"));
        assert_eq!(store.all().len(), 2);

        // Same origin again: replaced in place.
        assert_eq!(
            store.on_received(pin("dev-b", "OP north v2")),
            ReceiveOutcome::Replaced
        );
        assert_eq!(store.all().len(), 2);
    }

    #[test]
    fn replace_preserves_direction_of_own_echo() {
        let f = fixture();
        let store = DomainStore::<PinKind>::open(
            f.db.clone(),
            f.outbound.clone(),
            f.identity.clone(),
            f.events.clone(),
            DeviceAddress::from("dev-a"),
        );

        let own = DomainMessage::outgoing(
            "p1",
            DeviceAddress::from("dev-a"),
            "Alpha-1",
            Vec::new(),
            1_000,
            PinBody {
                lat: 1.0,
                lon: 2.0,
                title: "OP".to_string(),
                description: None,
                color: None,
            },
        );
        store.send(own.clone());

        // The broadcast loops back over UDP.
        let mut echo = own;
        echo.direction = Direction::Incoming;
        echo.is_read = false;
        store.on_received(echo);

        let stored = store.get("p1").unwrap();
        assert_eq!(stored.direction, Direction::Outgoing);
        assert!(stored.is_read);
    }

    #[test]
    fn send_creates_one_status_per_recipient() {
        let f = fixture();
        let store = order_store(&f);

        let msg = DomainMessage::outgoing(
            "41",
            DeviceAddress::from("dev-a"),
            "Alpha-1",
            vec![DeviceAddress::from("dev-b"), DeviceAddress::from("dev-c")],
            1_000,
            OrderBody {
                title: "Move".to_string(),
                text: "Move out".to_string(),
            },
        );
        store.send(msg);

        let statuses = store.statuses_for("41");
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.sent_at_millis > 0));
        assert!(statuses.iter().all(|s| s.delivered_at_millis.is_none()));
    }

    #[test]
    fn unaddressed_send_creates_no_statuses() {
        let f = fixture();
        let store = order_store(&f);

        let msg = DomainMessage::outgoing(
            "42",
            DeviceAddress::from("dev-a"),
            "Alpha-1",
            Vec::new(),
            1_000,
            OrderBody {
                title: "FYI".to_string(),
                text: "general broadcast".to_string(),
            },
        );
        store.send(msg);
        assert!(store.statuses_for("42").is_empty());
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn out_of_order_acks_both_land() {
        let f = fixture();
        let store = order_store(&f);

        store.send(DomainMessage::outgoing(
            "41",
            DeviceAddress::from("dev-a"),
            "Alpha-1",
            vec![DeviceAddress::from("dev-b")],
            1_000,
            OrderBody {
                title: "Move".to_string(),
                text: "Move out".to_string(),
            },
        ));

        let ack = |ack_type, ts| Acknowledgment {
            message_id: "41".to_string(),
            from_device: DeviceAddress::from("dev-b"),
            to_device: DeviceAddress::from("dev-a"),
            ack_type,
            timestamp_millis: ts,
        };

        // READ arrives first: the lost DELIVERED must not block it.
        store.on_ack(&ack(AckType::Read, 5_000));
        let s = &store.statuses_for("41")[0];
        assert_eq!(s.read_at_millis, Some(5_000));
        assert_eq!(s.delivered_at_millis, None);

        store.on_ack(&ack(AckType::Delivered, 4_000));
        let s = &store.statuses_for("41")[0];
        assert_eq!(s.read_at_millis, Some(5_000));
        assert_eq!(s.delivered_at_millis, Some(4_000));

        // Re-applied acks do not regress anything.
        store.on_ack(&ack(AckType::Delivered, 9_000));
        store.on_ack(&ack(AckType::Read, 9_000));
        let s = &store.statuses_for("41")[0];
        assert_eq!(s.read_at_millis, Some(5_000));
        assert_eq!(s.delivered_at_millis, Some(4_000));
    }

    #[test]
    fn ack_for_unknown_message_synthesizes_status() {
        let f = fixture();
        let store = order_store(&f);

        store.on_ack(&Acknowledgment {
            message_id: "pre-restart".to_string(),
            from_device: DeviceAddress::from("dev-b"),
            to_device: DeviceAddress::from("dev-a"),
            ack_type: AckType::Delivered,
            timestamp_millis: 5_000,
        });

        let statuses = store.statuses_for("pre-restart");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].delivered_at_millis, Some(5_000));
        assert!(statuses[0].sent_at_millis > 0);
    }

    #[test]
    fn unread_count_tracks_mark_read() {
        let f = fixture();
        let store = order_store(&f);

        store.on_received(incoming_order("41", "dev-b"));
        store.on_received(incoming_order("42", "dev-b"));
        assert_eq!(store.unread_count(), 2);

        assert!(store.mark_read("41"));
        assert_eq!(store.unread_count(), 1);

        // Second mark is a no-op.
        assert!(!store.mark_read("41"));
        assert_eq!(store.unread_count(), 1);
    }

    #[tokio::test]
    async fn mark_read_emits_exactly_one_read_ack() {
        let mut f = fixture();
        let store = order_store(&f);

        store.on_received(incoming_order("41", "dev-b"));
        store.mark_read("41");
        store.mark_read("41");

        let frame = f.frames.recv().await.unwrap();
        assert_eq!(frame.channel, "order_ack");
        let value: serde_json::Value = serde_json::from_slice(&frame.bytes).unwrap();
        let ack = protocol::decode_ack(value).unwrap();
        assert_eq!(ack.message_id, "41");
        assert_eq!(ack.ack_type, AckType::Read);
        assert_eq!(ack.to_device, DeviceAddress::from("dev-b"));
        assert_eq!(ack.from_device, DeviceAddress::from("dev-a"));

        // No second ack queued.
        assert!(f.frames.try_recv().is_err());
    }

    #[test]
    fn delete_removes_message_and_statuses() {
        let f = fixture();
        let store = order_store(&f);

        store.send(DomainMessage::outgoing(
            "41",
            DeviceAddress::from("dev-a"),
            "Alpha-1",
            vec![DeviceAddress::from("dev-b")],
            1_000,
            OrderBody {
                title: "Move".to_string(),
                text: "Move out".to_string(),
            },
        ));

        assert!(store.delete("41"));
        assert!(store.get("41").is_none());
        assert!(store.statuses_for("41").is_empty());
        assert!(!store.delete("41"));
    }

    #[test]
    fn per_origin_lookups_disambiguate_by_sender() {
        let f = fixture();
        let store = DomainStore::<PinKind>::open(
            f.db.clone(),
            f.outbound.clone(),
            f.identity.clone(),
            f.events.clone(),
            DeviceAddress::from("dev-a"),
        );

        let pin = |sender: &str, title: &str| DomainMessage {
            id: "p1".to_string(),
            created_at_millis: 1_000,
            sender_id: DeviceAddress::from(sender),
            sender_callsign: String::new(),
            recipients: Vec::new(),
            direction: Direction::Incoming,
            is_read: false,
            body: PinBody {
                lat: 1.0,
                lon: 2.0,
                title: title.to_string(),
                description: None,
                color: None,
            },
        };
        store.on_received(pin("dev-b", "OP north"));
        store.on_received(pin("dev-c", "OP south"));

        let south = store
            .get_from("p1", &DeviceAddress::from("dev-c"))
            .unwrap();
        assert_eq!(south.body.title, "OP south");

        assert!(store.mark_read_from("p1", &DeviceAddress::from("dev-c")));
        assert!(
            !store
                .get_from("p1", &DeviceAddress::from("dev-b"))
                .unwrap()
                .is_read
        );

        assert!(store.delete_from("p1", &DeviceAddress::from("dev-c")));
        assert_eq!(store.all().len(), 1);
        assert_eq!(
            store.get("p1").unwrap().sender_id,
            DeviceAddress::from("dev-b")
        );
        assert!(!store.delete_from("p1", &DeviceAddress::from("dev-c")));
    }

    #[test]
    fn state_survives_reload() {
        let f = fixture();
        {
            let store = order_store(&f);
            store.on_received(incoming_order("41", "dev-b"));
        }
        let reloaded = order_store(&f);
        assert_eq!(reloaded.all().len(), 1);
        assert_eq!(reloaded.unread_count(), 1);
    }
}
