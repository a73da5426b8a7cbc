// Transport backends for the taclink core: an MQTT broker client and a
// local UDP broadcast socket, each behind the same command/notification
// mpsc contract so the core never cares which medium delivered a payload.

pub mod mqtt;
pub mod transport;
pub mod udp;

mod error;

pub use error::NetError;
pub use mqtt::{spawn_mqtt, MqttConfig};
pub use transport::{ConnectionState, TransportCommand, TransportEvent};
pub use udp::{spawn_udp, UdpConfig};
