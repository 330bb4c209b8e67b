//! MQTT transport for operator commands and status publishing.

mod client;
mod integration;

pub use client::{MqttClient, MqttMessage, publish_retained};
pub use integration::{MqttIntegration, RelayedWebhook, Topics, describe_event};
