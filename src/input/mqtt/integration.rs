//! MQTT integration: operator commands in, replies and status out.
//!
//! Keeps MQTT internals out of main.rs. Topic layout under the configured
//! prefix:
//!
//! - `<prefix>/command/<action>`: operator commands (see [`OperatorAction`])
//! - `<prefix>/reply`: one [`OperatorReply`](crate::input::OperatorReply) per command
//! - `<prefix>/status`: retained [`StatusReport`], refreshed on every cycle
//!   event and periodically
//! - `<prefix>/webhook`: BTCPay deliveries relayed as [`RelayedWebhook`],
//!   answered on `<prefix>/webhook/reply`
//!
//! [`StatusReport`]: crate::controller::StatusReport

use super::client::{MqttClient, MqttMessage, publish_retained};
use crate::config::MqttConfig;
use crate::controller::CycleEvent;
use crate::input::operator::{OperatorAction, OperatorService};
use crate::input::webhook::WebhookHandler;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const STATUS_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Topic names derived from a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn command(&self, action: OperatorAction) -> String {
        format!("{}/command/{}", self.prefix, action)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/command/+", self.prefix)
    }

    pub fn reply(&self) -> String {
        format!("{}/reply", self.prefix)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn webhook(&self) -> String {
        format!("{}/webhook", self.prefix)
    }

    pub fn webhook_reply(&self) -> String {
        format!("{}/webhook/reply", self.prefix)
    }

    /// The action a command topic addresses, if it is one of ours.
    pub fn action_for_topic(&self, topic: &str) -> Option<OperatorAction> {
        let action = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("/command/")?;
        OperatorAction::from_str(action).ok()
    }
}

/// A webhook delivery forwarded over MQTT by whatever receives BTCPay's HTTP
/// POST. `body` is the raw request body, byte for byte, since the signature
/// covers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayedWebhook {
    #[serde(default)]
    pub signature: Option<String>,
    pub body: String,
}

/// Where a handled message should be answered.
#[derive(Debug, PartialEq)]
struct Outgoing {
    topic: String,
    payload: Value,
}

pub struct MqttIntegration {
    config: MqttConfig,
    topics: Topics,
    operator: OperatorService,
    webhook: Option<WebhookHandler>,
}

impl MqttIntegration {
    pub fn new(config: MqttConfig, operator: OperatorService) -> Self {
        let topics = Topics::new(config.topic_prefix.as_str());
        Self {
            config,
            topics,
            operator,
            webhook: None,
        }
    }

    /// Also accept relayed BTCPay webhooks.
    pub fn with_webhook(mut self, handler: WebhookHandler) -> Self {
        self.webhook = Some(handler);
        self
    }

    /// Spawn the integration. Abort the handle on shutdown.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!(
            "[MQTT] Connecting to {}:{}",
            self.config.broker_host, self.config.broker_port
        );

        let mqtt_client = MqttClient::new(&self.config);
        let client = mqtt_client.client();

        let (msg_tx, mut msg_rx) = mpsc::channel::<MqttMessage>(64);
        let (connections_tx, mut connections) = watch::channel(0u64);

        // Event loop first, so it can establish the connection.
        let mqtt_loop = tokio::spawn(async move {
            mqtt_client.run(msg_tx, connections_tx).await;
        });

        let first = tokio::time::timeout(CONNECT_TIMEOUT, async {
            connections.wait_for(|count| *count > 0).await.is_ok()
        })
        .await;
        match first {
            Ok(true) => {
                info!("[MQTT] Connection established, subscribing to commands");
            }
            Ok(false) => {
                warn!("[MQTT] Event loop ended before connecting");
                return;
            }
            Err(_) => {
                warn!(
                    "[MQTT] Connection timeout after {} seconds",
                    CONNECT_TIMEOUT.as_secs()
                );
                mqtt_loop.abort();
                return;
            }
        }

        self.subscribe_all(&client).await;
        let mut events = self.operator.controller().subscribe();
        let mut refresh = tokio::time::interval(STATUS_INTERVAL);

        info!("[MQTT] Integration started on {}", self.topics.command_filter());

        loop {
            tokio::select! {
                changed = connections.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    info!("[MQTT] Reconnected, restoring subscriptions");
                    self.subscribe_all(&client).await;
                    self.publish_status(&client).await;
                }
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Some(outgoing) = self.handle_message(&msg) {
                        self.publish_reply(&client, outgoing).await;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!("[MQTT] {}", describe_event(&event));
                        self.publish_status(&client).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("[MQTT] Missed {} cycle event(s)", missed);
                        self.publish_status(&client).await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = refresh.tick() => self.publish_status(&client).await,
            }
        }

        mqtt_loop.abort();
    }

    /// Topics this integration listens on.
    fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.topics.command_filter()];
        if self.webhook.is_some() {
            topics.push(self.topics.webhook());
        }
        topics
    }

    /// Subscribe to everything we listen on. Runs after every ConnAck, since
    /// the broker drops clean-session subscriptions with the connection.
    async fn subscribe_all(&self, client: &AsyncClient) {
        for topic in self.subscriptions() {
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                warn!("[MQTT] Failed to subscribe to {}: {:?}", topic, e);
            }
        }
    }

    /// Act on one incoming message. `None` for topics we do not handle.
    fn handle_message(&self, msg: &MqttMessage) -> Option<Outgoing> {
        if msg.topic == self.topics.webhook() {
            let handler = self.webhook.as_ref()?;
            return Some(Outgoing {
                topic: self.topics.webhook_reply(),
                payload: relay_webhook(handler, &msg.payload),
            });
        }

        let Some(action) = self.topics.action_for_topic(&msg.topic) else {
            warn!("[MQTT] Ignoring message on {}", msg.topic);
            return None;
        };

        let reply = self.operator.handle(action, msg.payload.as_bytes());
        info!("[MQTT] {} -> {}", action, reply.code);
        Some(Outgoing {
            topic: self.topics.reply(),
            payload: json!(reply),
        })
    }

    async fn publish_reply(&self, client: &AsyncClient, outgoing: Outgoing) {
        let payload = outgoing.payload.to_string();
        if let Err(e) = client
            .publish(outgoing.topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("[MQTT] Failed to publish reply: {:?}", e);
        }
    }

    async fn publish_status(&self, client: &AsyncClient) {
        let status = self.operator.controller().status();
        let payload = match serde_json::to_string(&status) {
            Ok(p) => p,
            Err(e) => {
                warn!("[MQTT] Failed to encode status: {}", e);
                return;
            }
        };
        if let Err(e) = publish_retained(client, &self.topics.status(), &payload).await {
            warn!("[MQTT] Failed to publish status: {:?}", e);
        }
    }
}

/// Unwrap a relayed delivery and answer with the status an HTTP endpoint
/// would have sent.
fn relay_webhook(handler: &WebhookHandler, payload: &str) -> Value {
    let relayed = match serde_json::from_str::<RelayedWebhook>(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!("[Webhook] Malformed relayed delivery: {}", e);
            return json!({"code": 400, "error": "Invalid JSON payload"});
        }
    };

    match handler.handle(relayed.body.as_bytes(), relayed.signature.as_deref()) {
        Ok(outcome) => {
            json!({"code": outcome.status_code(), "message": outcome.message()})
        }
        Err(e) => json!({"code": e.status_code(), "error": e.to_string()}),
    }
}

/// Log a cycle event the way the integration reports it.
pub fn describe_event(event: &CycleEvent) -> String {
    match event {
        CycleEvent::Started { cycle, duration } => {
            format!("cycle {} started for {}s", cycle, duration)
        }
        CycleEvent::Extended {
            cycle,
            added,
            total,
        } => format!("cycle {} extended by {}s ({}s total)", cycle, added, total),
        CycleEvent::Finished { cycle, reason } => {
            format!("cycle {} finished ({})", cycle, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::controller::{ActivationController, FinishReason};
    use crate::device::{ManualSwitch, SimulatedRelay};
    use crate::input::webhook::sign;
    use crate::invoice::InvoiceTracker;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_topics() {
        let topics = Topics::new("laundry/");
        assert_eq!(topics.command_filter(), "laundry/command/+");
        assert_eq!(topics.command(OperatorAction::AddTime), "laundry/command/add-time");
        assert_eq!(topics.reply(), "laundry/reply");
        assert_eq!(topics.status(), "laundry/status");
        assert_eq!(topics.webhook_reply(), "laundry/webhook/reply");
    }

    #[test]
    fn test_action_for_topic() {
        let topics = Topics::new("lightning-wash");
        assert_eq!(
            topics.action_for_topic("lightning-wash/command/start-wash"),
            Some(OperatorAction::StartWash)
        );
        assert_eq!(
            topics.action_for_topic("lightning-wash/command/status"),
            Some(OperatorAction::Status)
        );
        assert_eq!(topics.action_for_topic("lightning-wash/command/reboot"), None);
        assert_eq!(topics.action_for_topic("lightning-wash/status"), None);
        assert_eq!(topics.action_for_topic("other/command/status"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_message_routes_to_operator() {
        let controller = ActivationController::new(
            Arc::new(SimulatedRelay::new(17)),
            Arc::new(ManualSwitch::new(false)),
            3600,
        );
        let operator = OperatorService::new(controller.clone(), "s3cret");
        let config = Config::default().mqtt;
        let prefix = config.topic_prefix.clone();
        let integration = MqttIntegration::new(config, operator);

        let reply = integration
            .handle_message(&MqttMessage {
                topic: format!("{prefix}/command/start-wash"),
                payload: r#"{"secret":"s3cret","duration":45}"#.to_string(),
            })
            .unwrap();
        assert_eq!(reply.topic, format!("{prefix}/reply"));
        assert_eq!(reply.payload["code"], 200);
        assert_eq!(reply.payload["action"], "start-wash");
        assert_eq!(controller.status().total_duration, 45);

        assert!(
            integration
                .handle_message(&MqttMessage {
                    topic: format!("{prefix}/status"),
                    payload: String::new(),
                })
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayed_webhook() {
        let controller = ActivationController::new(
            Arc::new(SimulatedRelay::new(17)),
            Arc::new(ManualSwitch::new(false)),
            3600,
        );
        let config = Config::default();
        let tracker = Arc::new(InvoiceTracker::new(controller.clone()));
        let handler = WebhookHandler::new(config.webhook.clone(), tracker, 3600);
        let topic = Topics::new(config.mqtt.topic_prefix.as_str()).webhook();
        let integration = MqttIntegration::new(config.mqtt.clone(), OperatorService::new(controller.clone(), "s3cret"));

        // Without a handler the webhook topic is not ours.
        let msg = MqttMessage {
            topic: topic.clone(),
            payload: String::new(),
        };
        assert!(integration.handle_message(&msg).is_none());

        let integration = integration.with_webhook(handler);
        let body = r#"{"invoiceId":"inv-1","type":"InvoiceSettled","metadata":{"washDuration":90}}"#;
        let relayed = RelayedWebhook {
            signature: Some(sign(config.webhook.secret.as_bytes(), body.as_bytes())),
            body: body.to_string(),
        };
        let reply = integration
            .handle_message(&MqttMessage {
                topic: topic.clone(),
                payload: serde_json::to_string(&relayed).unwrap(),
            })
            .unwrap();
        assert_eq!(reply.payload["code"], 200);
        assert_eq!(controller.status().total_duration, 90);

        let forged = RelayedWebhook {
            signature: Some("sha256=00".to_string()),
            body: body.to_string(),
        };
        let reply = integration
            .handle_message(&MqttMessage {
                topic: topic.clone(),
                payload: serde_json::to_string(&forged).unwrap(),
            })
            .unwrap();
        assert_eq!(reply.payload["code"], 401);

        let reply = integration
            .handle_message(&MqttMessage {
                topic,
                payload: "not json".to_string(),
            })
            .unwrap();
        assert_eq!(reply.payload["code"], 400);
    }

    #[tokio::test]
    async fn test_subscriptions_follow_webhook_handler() {
        let controller = ActivationController::new(
            Arc::new(SimulatedRelay::new(17)),
            Arc::new(ManualSwitch::new(false)),
            3600,
        );
        let config = Config::default();
        let tracker = Arc::new(InvoiceTracker::new(controller.clone()));
        let integration = MqttIntegration::new(config.mqtt.clone(), OperatorService::new(controller, "s3cret"));
        assert_eq!(integration.subscriptions(), vec!["lightning-wash/command/+".to_string()]);

        let integration = integration.with_webhook(WebhookHandler::new(config.webhook, tracker, 3600));
        assert_eq!(
            integration.subscriptions(),
            vec![
                "lightning-wash/command/+".to_string(),
                "lightning-wash/webhook".to_string()
            ]
        );
    }

    /// One MQTT control packet: fixed header byte and body.
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn read_str(body: &[u8], at: usize) -> (String, usize) {
        let len = usize::from(u16::from_be_bytes([body[at], body[at + 1]]));
        let end = at + 2 + len;
        (String::from_utf8(body[at + 2..end].to_vec()).unwrap(), end)
    }

    /// Accept a client, complete the handshake and return the first topic
    /// it subscribes to.
    async fn accept_session(listener: &TcpListener) -> (TcpStream, String) {
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let (header, body) = read_packet(&mut stream).await.unwrap();
            match header >> 4 {
                // CONNECT
                1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap(),
                // SUBSCRIBE
                8 => {
                    stream
                        .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
                        .await
                        .unwrap();
                    let (topic, _) = read_str(&body, 2);
                    return (stream, topic);
                }
                // PINGREQ
                12 => stream.write_all(&[0xd0, 0x00]).await.unwrap(),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_commands_still_routed_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default().mqtt;
        config.broker_host = "127.0.0.1".to_string();
        config.broker_port = listener.local_addr().unwrap().port();
        config.reconnect_delay_secs = 0;
        let topics = Topics::new(config.topic_prefix.as_str());

        let controller = ActivationController::new(
            Arc::new(SimulatedRelay::new(17)),
            Arc::new(ManualSwitch::new(false)),
            3600,
        );
        let task = MqttIntegration::new(config, OperatorService::new(controller, "s3cret")).start();

        let broker = async {
            let (first, topic) = accept_session(&listener).await;
            assert_eq!(topic, topics.command_filter());
            drop(first);

            let (mut stream, topic) = accept_session(&listener).await;
            assert_eq!(topic, topics.command_filter());

            let command = topics.command(OperatorAction::Status);
            let mut publish = vec![0x30, u8::try_from(2 + command.len()).unwrap()];
            publish.extend(u16::try_from(command.len()).unwrap().to_be_bytes());
            publish.extend(command.as_bytes());
            stream.write_all(&publish).await.unwrap();

            loop {
                let (header, body) = read_packet(&mut stream).await.unwrap();
                if header >> 4 != 3 {
                    continue;
                }
                let (topic, mut at) = read_str(&body, 0);
                if (header >> 1) & 0x03 > 0 {
                    at += 2;
                }
                if topic == topics.reply() {
                    return serde_json::from_slice::<Value>(&body[at..]).unwrap();
                }
            }
        };

        let reply = tokio::time::timeout(Duration::from_secs(10), broker)
            .await
            .expect("no reply after reconnecting");
        assert_eq!(reply["action"], "status");
        assert_eq!(reply["code"], 200);
        task.abort();
    }

    #[test]
    fn test_describe_event() {
        let text = describe_event(&CycleEvent::Finished {
            cycle: 3,
            reason: FinishReason::Stopped,
        });
        assert_eq!(text, "cycle 3 finished (stopped)");
    }
}
