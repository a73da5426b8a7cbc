//! MQTT transport backend built on rumqttc.
//!
//! Logical channels map to broker topics under a configurable prefix
//! (`<prefix>/<channel>`). The event loop task owns both the command
//! receiver and the rumqttc event loop; rumqttc reconnects on the next poll
//! after a connection error, so broker outages degrade to dropped traffic
//! rather than a dead task.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use taclink_shared::constants::{DEFAULT_MQTT_PORT, DEFAULT_TOPIC_PREFIX};

use crate::transport::{ConnectionState, TransportCommand, TransportEvent};

/// Label this backend stamps on its [`TransportEvent`]s.
pub const TRANSPORT_NAME: &str = "mqtt";

/// Configuration for the MQTT backend.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Client id presented to the broker; must be unique per device, so the
    /// device address is the natural choice.
    pub client_id: String,
    /// Topic prefix under which all channels live.
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn new(broker_host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port: DEFAULT_MQTT_PORT,
            client_id: client_id.into(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            keep_alive_secs: 30,
        }
    }

    fn topic(&self, channel: &str) -> String {
        format!("{}/{}", self.topic_prefix, channel)
    }
}

/// Spawn the MQTT backend in a background tokio task.
///
/// Events are delivered on the shared `events` channel; the returned sender
/// accepts [`TransportCommand`]s.
pub fn spawn_mqtt(
    config: MqttConfig,
    events: mpsc::Sender<TransportEvent>,
) -> mpsc::Sender<TransportCommand> {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_max_packet_size(1024 * 1024, 1024 * 1024);

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<TransportCommand>(256);

    info!(
        host = %config.broker_host,
        port = config.broker_port,
        client_id = %config.client_id,
        "starting MQTT transport"
    );

    tokio::spawn(async move {
        let prefix = format!("{}/", config.topic_prefix);
        let mut connected = false;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Publish { channel, payload }) => {
                            let topic = config.topic(&channel);
                            if let Err(e) = client
                                .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
                                .await
                            {
                                warn!(channel = %channel, error = %e, "MQTT publish failed");
                            }
                        }
                        Some(TransportCommand::Subscribe(channel)) => {
                            let topic = config.topic(&channel);
                            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                                warn!(topic = %topic, error = %e, "MQTT subscribe failed");
                            }
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            info!("MQTT transport shutting down");
                            let _ = client.disconnect().await;
                            break;
                        }
                    }
                }

                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            connected = true;
                            info!("MQTT connected");
                            let _ = events
                                .send(TransportEvent::StateChanged {
                                    transport: TRANSPORT_NAME,
                                    state: ConnectionState::Connected,
                                })
                                .await;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let channel = publish
                                .topic
                                .strip_prefix(&prefix)
                                .unwrap_or(&publish.topic)
                                .to_string();
                            debug!(
                                channel = %channel,
                                len = publish.payload.len(),
                                "MQTT message received"
                            );
                            let _ = events
                                .send(TransportEvent::Message {
                                    transport: TRANSPORT_NAME,
                                    channel,
                                    payload: Bytes::from(publish.payload.to_vec()),
                                })
                                .await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if connected {
                                connected = false;
                                warn!(error = %e, "MQTT connection lost");
                                let _ = events
                                    .send(TransportEvent::StateChanged {
                                        transport: TRANSPORT_NAME,
                                        state: ConnectionState::Disconnected,
                                    })
                                    .await;
                            } else {
                                debug!(error = %e, "MQTT connect attempt failed");
                            }
                            // Back off before rumqttc retries on the next poll.
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    });

    cmd_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_maps_under_topic_prefix() {
        let config = MqttConfig::new("broker.local", "dev-a");
        assert_eq!(config.topic("order"), "taclink/order");
        assert_eq!(config.topic("order_ack"), "taclink/order_ack");
    }
}
