//! # taclink-shared
//!
//! Wire-level types shared by every layer of the taclink stack: device
//! addresses, message kinds and their channel mapping, the domain message
//! model with per-recipient delivery tracking, and the JSON codec.

pub mod constants;
pub mod message;
pub mod protocol;
pub mod types;

pub use message::{AckType, Acknowledgment, Direction, DomainMessage, RecipientStatus};
pub use protocol::{CodecError, Kind};
pub use types::{ChannelRoute, DeviceAddress, MessageKind};

/// Current time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
