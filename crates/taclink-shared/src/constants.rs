/// Default maximum accepted message age in minutes (replay filter).
/// Zero disables the filter entirely.
pub const DEFAULT_MAX_MESSAGE_AGE_MIN: i64 = 360;

/// Default MQTT broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default topic prefix under which all channels live on the broker.
pub const DEFAULT_TOPIC_PREFIX: &str = "taclink";

/// Default UDP broadcast port for the local-network transport.
pub const DEFAULT_UDP_PORT: u16 = 17788;

/// Maximum UDP datagram payload we will emit or accept.
pub const MAX_UDP_PAYLOAD: usize = 60 * 1024;

/// Default duration of the pin sync window in seconds.
pub const DEFAULT_PIN_SYNC_WINDOW_SECS: u64 = 30;

/// Maximum stored callsign length (characters).
pub const MAX_CALLSIGN_LEN: usize = 32;

/// Maximum stored nickname length (characters).
pub const MAX_NICKNAME_LEN: usize = 64;
