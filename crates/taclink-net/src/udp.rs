//! Local-network UDP broadcast transport backend.
//!
//! Every publish is one datagram broadcast to the configured address; every
//! peer on the segment (including the sender itself) hears it. A small JSON
//! frame carries the logical channel name alongside the payload body. The
//! core's dedup and self-ack suppression make the loopback copy harmless.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use taclink_shared::constants::{DEFAULT_UDP_PORT, MAX_UDP_PAYLOAD};

use crate::error::NetError;
use crate::transport::{ConnectionState, TransportCommand, TransportEvent};

/// Label this backend stamps on its [`TransportEvent`]s.
pub const TRANSPORT_NAME: &str = "udp";

/// Configuration for the UDP broadcast backend.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Port to bind and broadcast on.
    pub port: u16,
    /// Broadcast destination; defaults to the limited broadcast address.
    pub broadcast_addr: Option<SocketAddr>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_UDP_PORT,
            broadcast_addr: None,
        }
    }
}

/// Datagram frame: the channel name plus the payload's JSON body.
#[derive(Debug, Serialize, Deserialize)]
struct UdpFrame {
    channel: String,
    body: serde_json::Value,
}

/// Wrap a JSON payload into a datagram frame for the given channel.
fn encode_frame(channel: &str, payload: &[u8]) -> Result<Vec<u8>, NetError> {
    let body: serde_json::Value = serde_json::from_slice(payload)?;
    let frame = UdpFrame {
        channel: channel.to_string(),
        body,
    };
    Ok(serde_json::to_vec(&frame)?)
}

/// Split a datagram back into channel name and payload bytes.
fn decode_frame(bytes: &[u8]) -> Result<(String, Vec<u8>), NetError> {
    let frame: UdpFrame = serde_json::from_slice(bytes)?;
    let payload = serde_json::to_vec(&frame.body)?;
    Ok((frame.channel, payload))
}

/// Spawn the UDP broadcast backend in a background tokio task.
///
/// Fails only on socket setup; runtime errors are logged and swallowed.
pub async fn spawn_udp(
    config: UdpConfig,
    events: mpsc::Sender<TransportEvent>,
) -> Result<mpsc::Sender<TransportCommand>, NetError> {
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.set_broadcast(true)?;

    let target = config
        .broadcast_addr
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::BROADCAST, config.port)));

    info!(port = config.port, target = %target, "starting UDP broadcast transport");

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<TransportCommand>(256);

    tokio::spawn(async move {
        // Bound and broadcasting; there is no session to establish.
        let _ = events
            .send(TransportEvent::StateChanged {
                transport: TRANSPORT_NAME,
                state: ConnectionState::Connected,
            })
            .await;

        let mut subscribed: HashSet<String> = HashSet::new();
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Publish { channel, payload }) => {
                            match encode_frame(&channel, &payload) {
                                Ok(frame) if frame.len() <= MAX_UDP_PAYLOAD => {
                                    if let Err(e) = socket.send_to(&frame, target).await {
                                        warn!(channel = %channel, error = %e, "UDP send failed");
                                    }
                                }
                                Ok(frame) => {
                                    warn!(
                                        channel = %channel,
                                        len = frame.len(),
                                        "UDP payload exceeds datagram limit, dropped"
                                    );
                                }
                                Err(e) => {
                                    warn!(channel = %channel, error = %e, "UDP frame encode failed");
                                }
                            }
                        }
                        Some(TransportCommand::Subscribe(channel)) => {
                            subscribed.insert(channel);
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            info!("UDP transport shutting down");
                            break;
                        }
                    }
                }

                recv = socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => {
                            match decode_frame(&buf[..len]) {
                                Ok((channel, payload)) => {
                                    if !subscribed.contains(&channel) {
                                        debug!(channel = %channel, "datagram for unsubscribed channel, dropped");
                                        continue;
                                    }
                                    let _ = events
                                        .send(TransportEvent::Message {
                                            transport: TRANSPORT_NAME,
                                            channel,
                                            payload: Bytes::from(payload),
                                        })
                                        .await;
                                }
                                Err(e) => {
                                    debug!(from = %from, error = %e, "malformed datagram, dropped");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "UDP receive error");
                        }
                    }
                }
            }
        }
    });

    Ok(cmd_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_preserves_channel_and_body() {
        let payload = br#"{"type":"pin","id":"p1","deviceId":"dev-a","ts":42,
                           "lat":59.4,"lon":24.7,"title":"OP"}"#;
        let frame = encode_frame("pin", payload).unwrap();
        let (channel, body) = decode_frame(&frame).unwrap();

        assert_eq!(channel, "pin");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["id"], "p1");
        assert_eq!(value["ts"], 42);
    }

    #[test]
    fn non_json_payload_is_a_frame_error() {
        assert!(encode_frame("pin", b"\x00\x01binary").is_err());
        assert!(decode_frame(b"garbage").is_err());
    }
}
