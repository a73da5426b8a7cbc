//! Identity resolver: a merge-on-write cache of peer identity, used to label
//! senders and recipients when an ack or message arrives before a full
//! profile is known.
//!
//! Shared-read by every domain store; merges are serialized behind the
//! internal mutex. Persisted as one collection and loaded at startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use taclink_shared::constants::{MAX_CALLSIGN_LEN, MAX_NICKNAME_LEN};
use taclink_shared::DeviceAddress;
use taclink_store::Database;

const COLLECTION: &str = "identity";

/// Sentinel role meaning "no role assigned"; never overwrites a real role.
pub const ROLE_NONE: &str = "none";

/// Free-text values treated as meaningless placeholders.
const PLACEHOLDERS: [&str; 3] = ["null", "undefined", "unknown"];

/// What is known about one peer device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub device_id: DeviceAddress,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub last_seen_millis: i64,
    /// Which transport last carried news of this peer, when known.
    #[serde(default)]
    pub origin_network: Option<String>,
}

impl IdentityRecord {
    pub fn new(device_id: DeviceAddress) -> Self {
        Self {
            device_id,
            role: ROLE_NONE.to_string(),
            ..Default::default()
        }
    }
}

/// Sanitize a free-text identity field for storage.
///
/// Trims whitespace, rejects empty strings and placeholder spellings,
/// rejects values that look like a device id or hex identifier (so an id is
/// never accidentally displayed as a name), and prefix-truncates to
/// `max_len` characters.
pub fn sanitize_field(value: &str, max_len: usize) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    if PLACEHOLDERS.contains(&lower.as_str()) {
        return None;
    }
    if looks_like_identifier(trimmed) {
        return None;
    }

    let truncated: String = trimmed.chars().take(max_len).collect();
    Some(truncated)
}

/// Heuristic for device-id / hex-identifier shaped strings: long, no
/// spaces, and entirely hex digits plus separators.
fn looks_like_identifier(value: &str) -> bool {
    if value.len() < 16 {
        return false;
    }
    value
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == '-' || c == ':')
}

/// Prefix-truncate for display, appending an ellipsis when shortened.
pub fn truncate_for_display(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    let prefix: String = value.chars().take(max_len).collect();
    format!("{prefix}…")
}

/// The merge-on-write identity cache.
pub struct IdentityResolver {
    records: Mutex<HashMap<DeviceAddress, IdentityRecord>>,
    db: Arc<Database>,
}

impl IdentityResolver {
    /// Load the persisted cache, starting empty if the collection is
    /// missing or unreadable.
    pub fn open(db: Arc<Database>) -> Self {
        let loaded: Vec<IdentityRecord> = db.load_collection(COLLECTION).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load identity cache, starting empty");
            Vec::new()
        });
        let records = loaded
            .into_iter()
            .map(|r| (r.device_id.clone(), r))
            .collect();
        Self {
            records: Mutex::new(records),
            db,
        }
    }

    /// O(1) lookup by device address.
    pub fn lookup(&self, device: &DeviceAddress) -> Option<IdentityRecord> {
        let records = self.records.lock().expect("identity mutex poisoned");
        records.get(device).cloned()
    }

    /// Best display label for a peer: callsign, else nickname, else the
    /// first 8 characters of the device address.
    pub fn display_name(&self, device: &DeviceAddress) -> String {
        if let Some(record) = self.lookup(device) {
            if !record.callsign.is_empty() {
                return truncate_for_display(&record.callsign, MAX_CALLSIGN_LEN);
            }
            if !record.nickname.is_empty() {
                return truncate_for_display(&record.nickname, MAX_NICKNAME_LEN);
            }
        }
        device.short().to_string()
    }

    /// Callsign for a peer, empty string when unknown. Used to label
    /// recipient status records at send time.
    pub fn callsign_or_empty(&self, device: &DeviceAddress) -> String {
        self.lookup(device).map(|r| r.callsign).unwrap_or_default()
    }

    /// Merge an incoming record into the cache.
    ///
    /// Field-by-field precedence: a sanitized non-empty incoming value
    /// overwrites the stored one; placeholders and empties never do. The
    /// role only changes when the incoming role is a real one. `lastSeen`
    /// advances monotonically.
    pub fn merge(&self, incoming: IdentityRecord) {
        {
            let mut records = self.records.lock().expect("identity mutex poisoned");
            let entry = records
                .entry(incoming.device_id.clone())
                .or_insert_with(|| IdentityRecord::new(incoming.device_id.clone()));

            merge_field(&mut entry.callsign, &incoming.callsign, MAX_CALLSIGN_LEN);
            merge_field(&mut entry.nickname, &incoming.nickname, MAX_NICKNAME_LEN);
            merge_field(&mut entry.first_name, &incoming.first_name, MAX_NICKNAME_LEN);
            merge_field(&mut entry.last_name, &incoming.last_name, MAX_NICKNAME_LEN);
            merge_field(&mut entry.unit, &incoming.unit, MAX_NICKNAME_LEN);

            if let Some(role) = sanitize_field(&incoming.role, MAX_CALLSIGN_LEN) {
                if role != ROLE_NONE {
                    entry.role = role;
                }
            }
            if incoming.origin_network.is_some() {
                entry.origin_network = incoming.origin_network;
            }
            entry.last_seen_millis = entry.last_seen_millis.max(incoming.last_seen_millis);
        }
        self.persist();
    }

    /// Side-channel update from any inbound message carrying a sender
    /// callsign: advances lastSeen and opportunistically fills the callsign.
    pub fn observe(&self, device: &DeviceAddress, callsign: &str, now_millis: i64) {
        let mut record = IdentityRecord::new(device.clone());
        record.callsign = callsign.to_string();
        record.last_seen_millis = now_millis;
        self.merge(record);
    }

    /// Snapshot of all known peers, most recently seen first.
    pub fn all(&self) -> Vec<IdentityRecord> {
        let records = self.records.lock().expect("identity mutex poisoned");
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen_millis.cmp(&a.last_seen_millis));
        all
    }

    fn persist(&self) {
        let snapshot: Vec<IdentityRecord> = {
            let records = self.records.lock().expect("identity mutex poisoned");
            records.values().cloned().collect()
        };
        if let Err(e) = self.db.save_collection(COLLECTION, &snapshot) {
            warn!(error = %e, "failed to persist identity cache");
        }
    }
}

fn merge_field(stored: &mut String, incoming: &str, max_len: usize) {
    if let Some(clean) = sanitize_field(incoming, max_len) {
        *stored = clean;
    }
}
