use thiserror::Error;

/// Errors produced by the transport layer.
///
/// Only setup failures surface as errors; runtime send/receive failures are
/// logged inside the backend event loops and swallowed, since delivery over
/// these media is best-effort by contract.
#[derive(Error, Debug)]
pub enum NetError {
    /// Socket setup failure (bind, broadcast option).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame (de)serialization failure.
    #[error("Frame error: {0}")]
    Frame(#[from] serde_json::Error),
}
