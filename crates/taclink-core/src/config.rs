//! Core configuration and first-launch device identity.

use std::time::Duration;

use taclink_shared::constants::{DEFAULT_MAX_MESSAGE_AGE_MIN, DEFAULT_PIN_SYNC_WINDOW_SECS};
use taclink_shared::DeviceAddress;
use taclink_store::{Database, Result as StoreResult};

const META_DEVICE_ID: &str = "device_id";

/// Configuration of the messaging core for one session.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// This device's stable self-assigned address.
    pub device_id: DeviceAddress,
    /// The local operator's callsign, stamped on outgoing messages.
    pub callsign: String,
    /// Inbound messages older than this are discarded; 0 disables the
    /// replay filter.
    pub max_message_age_minutes: i64,
    /// How long the pin sync gate stays open after an explicit request.
    pub pin_sync_window: Duration,
}

impl CoreConfig {
    pub fn new(device_id: DeviceAddress, callsign: impl Into<String>) -> Self {
        Self {
            device_id,
            callsign: callsign.into(),
            max_message_age_minutes: DEFAULT_MAX_MESSAGE_AGE_MIN,
            pin_sync_window: Duration::from_secs(DEFAULT_PIN_SYNC_WINDOW_SECS),
        }
    }
}

/// Load the persisted device address, generating and persisting a fresh one
/// on first launch.
pub fn load_or_generate_device(db: &Database) -> StoreResult<DeviceAddress> {
    if let Some(existing) = db.get_meta(META_DEVICE_ID)? {
        return Ok(DeviceAddress(existing));
    }

    let fresh = DeviceAddress::generate();
    db.set_meta(META_DEVICE_ID, fresh.as_str())?;
    tracing::info!(device = %fresh, "generated device address on first launch");
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_is_stable_across_loads() {
        let db = Database::open_in_memory().unwrap();

        let first = load_or_generate_device(&db).unwrap();
        let second = load_or_generate_device(&db).unwrap();
        assert_eq!(first, second);
    }
}
