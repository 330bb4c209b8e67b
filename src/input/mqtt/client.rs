//! MQTT client wrapper around rumqttc.

use crate::config::MqttConfig;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Message received from the MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
    reconnect_delay: Duration,
}

impl MqttClient {
    pub fn new(config: &MqttConfig) -> Self {
        Self::with_client_id(config, &config.client_id)
    }

    /// Same broker and credentials as `config`, different client id. Used
    /// by tools that talk to a running controller over the same broker.
    pub fn with_client_id(config: &MqttConfig, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self {
            client,
            event_loop,
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
        }
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), rumqttc::ClientError> {
        info!("[MQTT] Subscribing to {}", topic);
        self.client.subscribe(topic, QoS::AtLeastOnce).await
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), rumqttc::ClientError> {
        debug!("[MQTT] Publishing to {}: {}", topic, payload);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes())
            .await
    }

    /// Run the event loop, forwarding incoming publishes to `tx`.
    ///
    /// `connections` counts ConnAcks: it moves on every (re)connect, and the
    /// broker has forgotten our subscriptions each time. rumqttc reconnects
    /// on the next poll after an error, so errors only pause the loop.
    pub async fn run(mut self, tx: mpsc::Sender<MqttMessage>, connections: watch::Sender<u64>) {
        info!("[MQTT] Starting event loop");

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[MQTT] Connected to broker");
                    connections.send_modify(|count| *count += 1);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("[MQTT] Invalid UTF-8 in payload on {}: {}", topic, e);
                            continue;
                        }
                    };

                    debug!("[MQTT] Received on {}: {}", topic, payload);

                    let msg = MqttMessage { topic, payload };
                    if tx.send(msg).await.is_err() {
                        error!("[MQTT] Message channel closed");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[MQTT] Connection error: {:?}", e);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    /// Clone of the async client for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}

/// Publish `payload` as the retained value of `topic`.
pub async fn publish_retained(
    client: &AsyncClient,
    topic: &str,
    payload: &str,
) -> Result<(), rumqttc::ClientError> {
    debug!("[MQTT] Publishing retained {}: {}", topic, payload);
    client
        .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes())
        .await
}
