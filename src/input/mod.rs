//! Input sources that drive the activation controller.
//!
//! Current input sources:
//! - `webhook`: BTCPay invoice webhooks (settle and refund)
//! - `bitcoin_switch`: BTCPay Bitcoin Switch websocket
//! - `mqtt`: operator commands and status publishing
//!
//! `operator` holds the transport-independent operator command handling and
//! `backoff` the reconnect policy shared by long-lived connections.

pub mod backoff;
pub mod bitcoin_switch;
pub mod mqtt;
pub mod operator;
pub mod webhook;

pub use bitcoin_switch::BitcoinSwitchClient;
pub use mqtt::MqttIntegration;
pub use operator::{OperatorAction, OperatorReply, OperatorService};
pub use webhook::WebhookHandler;
