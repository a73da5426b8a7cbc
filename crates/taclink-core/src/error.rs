use thiserror::Error;

/// Errors produced by the messaging core.
///
/// These mostly stay inside the core: the inbound path logs and swallows
/// them per the best-effort delivery contract, and persistence failures are
/// logged where they occur rather than propagated.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Wire payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] taclink_shared::CodecError),
}
