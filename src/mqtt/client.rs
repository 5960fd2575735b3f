//! MQTT client wrapper for the command and feedback topics.

use crate::config::MqttConfig;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Request queue slots beyond the startup snapshot.
const REQUEST_CAPACITY: usize = 100;

/// Message received from the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
    subscription: String,
}

impl MqttClient {
    /// Create a client that subscribes to `subscription` on every connect.
    /// `backlog` extra request slots are reserved for publishes queued
    /// before the event loop runs.
    pub fn new(config: &MqttConfig, subscription: impl Into<String>, backlog: usize) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(KEEP_ALIVE);

        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY + backlog);

        Self {
            client,
            event_loop,
            subscription: subscription.into(),
        }
    }

    /// Clone of the async client, for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Run the event loop, forwarding inbound publishes to `tx`.
    ///
    /// The command subscription is re-issued on every ConnAck, so a broker
    /// restart does not lose it. `connected` fires on the first ConnAck.
    /// Returns when `tx` is closed.
    pub async fn run(mut self, tx: mpsc::Sender<MqttMessage>, connected: Option<oneshot::Sender<()>>) {
        info!("Starting MQTT event loop");
        let mut connected = connected;

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to MQTT broker ({:?})", ack.code);
                    info!("Subscribing to MQTT topic: {}", self.subscription);
                    if let Err(e) = self.client.try_subscribe(&self.subscription, QoS::AtMostOnce) {
                        error!("Could not subscribe to {}: {}", self.subscription, e);
                    }
                    if let Some(connected) = connected.take() {
                        let _ = connected.send(());
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("Invalid UTF-8 in MQTT payload on {}: {}", publish.topic, e);
                            continue;
                        }
                    };

                    debug!("Received MQTT message on {}: {}", publish.topic, payload);

                    let msg = MqttMessage {
                        topic: publish.topic,
                        payload,
                    };
                    if tx.send(msg).await.is_err() {
                        info!("MQTT message channel closed, stopping event loop");
                        break;
                    }
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if tx.is_closed() {
                        break;
                    }
                    error!("MQTT connection error: {:?}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(username: Option<&str>) -> MqttConfig {
        MqttConfig {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "lutron-mqtt-test".to_string(),
            username: username.map(str::to_string),
            password: None,
            command_topic: "/lutron/command".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_stops_when_receiver_dropped() {
        // Nothing listens on port 1, so every poll fails fast
        let mut cfg = config(Some("user"));
        cfg.broker_port = 1;
        let client = MqttClient::new(&cfg, "/lutron/command/#", 0);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(5), client.run(tx, None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_is_cloneable() {
        let client = MqttClient::new(&config(None), "/lutron/command/#", 0);
        let publisher = client.client();
        assert!(publisher.try_publish("/t", QoS::AtMostOnce, false, "x").is_ok());
    }
}
