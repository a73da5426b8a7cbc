//! Outbound pump: fans frames out to every transport backend.
//!
//! All sends are fire-and-forget. A full or closed transport queue drops
//! the frame with a log entry; the caller is never blocked past local
//! persistence and never sees a network error.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use taclink_net::TransportCommand;
use taclink_shared::{protocol, Acknowledgment, MessageKind};

/// One wire payload bound for a logical channel on every transport.
#[derive(Debug)]
pub struct OutboundFrame {
    pub channel: String,
    pub bytes: Vec<u8>,
}

/// Cloneable handle for pushing frames into the outbound pump.
#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl OutboundHandle {
    /// Queue a payload for broadcast on a channel. Never blocks.
    pub fn publish(&self, channel: impl Into<String>, bytes: Vec<u8>) {
        let frame = OutboundFrame {
            channel: channel.into(),
            bytes,
        };
        if let Err(e) = self.tx.try_send(frame) {
            warn!(error = %e, "outbound queue rejected frame, dropped");
        }
    }

    /// Encode and queue an acknowledgment on its kind's ack channel.
    pub fn send_ack(&self, kind: MessageKind, ack: &Acknowledgment) {
        let Some(channel) = kind.ack_channel() else {
            debug!(kind = ?kind, "kind has no ack channel, ack suppressed");
            return;
        };
        match protocol::encode_ack(ack) {
            Ok(bytes) => {
                debug!(
                    kind = ?kind,
                    message_id = %ack.message_id,
                    to = %ack.to_device,
                    ack_type = ?ack.ack_type,
                    "sending ack"
                );
                self.publish(channel, bytes);
            }
            Err(e) => warn!(error = %e, "failed to encode ack"),
        }
    }
}

/// Build a detached handle/receiver pair. Used by [`spawn_outbound`] and by
/// tests that want to observe the raw frame stream.
pub(crate) fn outbound_channel(capacity: usize) -> (OutboundHandle, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel::<OutboundFrame>(capacity);
    (OutboundHandle { tx }, rx)
}

/// Spawn the pump task. Frames pushed through the returned handle are
/// replicated to every transport's command queue.
pub fn spawn_outbound(transports: Vec<mpsc::Sender<TransportCommand>>) -> OutboundHandle {
    let (handle, mut rx) = outbound_channel(512);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            for transport in &transports {
                let cmd = TransportCommand::Publish {
                    channel: frame.channel.clone(),
                    payload: Bytes::from(frame.bytes.clone()),
                };
                if transport.try_send(cmd).is_err() {
                    warn!(channel = %frame.channel, "transport queue unavailable, frame dropped");
                }
            }
        }
        debug!("outbound pump terminated");
    });

    handle
}
