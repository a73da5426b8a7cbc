//! # taclink-core
//!
//! The message delivery and acknowledgment core: a delivery coordinator
//! routing domain messages over pluggable transports, one generic domain
//! store per message kind with per-recipient delivery tracking, an identity
//! resolver merging peer profiles opportunistically, and an age-based replay
//! filter. Delivery is best-effort by design: sends are fire-and-forget,
//! inbound failures are logged and swallowed, and duplicate delivery across
//! transports is absorbed by idempotent receipt.

pub mod config;
pub mod coordinator;
pub mod events;
pub mod identity;
pub mod node;
pub mod outbound;
pub mod replay;
pub mod store;
pub mod sync;

mod error;

pub use config::CoreConfig;
pub use coordinator::Coordinator;
pub use error::CoreError;
pub use events::CoreEvent;
pub use identity::{IdentityRecord, IdentityResolver};
pub use node::Node;
pub use store::DomainStore;

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise tracing for an embedding application. Call once at startup.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("taclink_core=debug,taclink_net=debug,taclink_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
