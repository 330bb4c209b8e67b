//! BTCPay Server webhook handling.
//!
//! Verifies the `BTCPay-Sig` header, parses the invoice payload and turns
//! settlement and refund events into calls on the [`InvoiceTracker`]. This is
//! the transport-independent half of the webhook endpoint: an HTTP layer
//! passes the raw body and signature header to [`WebhookHandler::handle`] and
//! maps the result through [`WebhookOutcome::status_code`] /
//! [`WebhookError::status_code`].

use crate::config::WebhookConfig;
use crate::error::Rejected;
use crate::invoice::InvoiceTracker;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Header carrying the body signature, formatted `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "BTCPay-Sig";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook integration is disabled")]
    Disabled,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("could not parse payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("invalid duration for invoice {invoice_id}: {duration}")]
    InvalidDuration { invoice_id: String, duration: String },

    #[error("failed to {action} washing machine: {reason}")]
    Refused {
        action: &'static str,
        reason: Rejected,
    },
}

impl WebhookError {
    /// HTTP status an endpoint should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Disabled => 503,
            Self::InvalidSignature => 401,
            Self::InvalidPayload(_) => 400,
            Self::InvalidDuration { .. } | Self::Refused { .. } => 500,
        }
    }
}

/// What a verified webhook did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Started { invoice_id: String, duration: u32 },
    Stopped { invoice_id: String },
    /// Event type we do not act on; acknowledged anyway.
    Ignored { event_type: String },
}

impl WebhookOutcome {
    pub fn status_code(&self) -> u16 {
        200
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Started { .. } => "Washing machine started",
            Self::Stopped { .. } => "Washing machine stopped",
            Self::Ignored { .. } => "Event acknowledged but not processed",
        }
    }
}

/// BTCPay invoice event types we distinguish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceEvent {
    Settled,
    Refunded,
    Other(String),
}

impl From<&str> for InvoiceEvent {
    fn from(s: &str) -> Self {
        match s {
            "InvoiceSettled" | "InvoicePaymentSettled" => InvoiceEvent::Settled,
            "InvoiceRefunded" | "InvoicePaymentRefunded" => InvoiceEvent::Refunded,
            other => InvoiceEvent::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    #[serde(default)]
    invoice_id: String,
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    metadata: Option<InvoiceMetadata>,
    /// Price in sats, used as seconds when no explicit duration is given.
    #[serde(default)]
    amount: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceMetadata {
    /// Kept loose: a float or string here is an invalid duration, not an
    /// unparseable payload.
    #[serde(default)]
    wash_duration: Option<Value>,
}

/// Wash time requested by an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WashDuration {
    /// Whole seconds; 0 when the payload carries none.
    Seconds(i64),
    /// `metadata.washDuration` was present but not an integer.
    Malformed(String),
}

impl WashDuration {
    fn from_metadata(value: Option<Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Seconds(0),
            Some(value) => match value.as_i64() {
                Some(seconds) => Self::Seconds(seconds),
                None => Self::Malformed(value.to_string()),
            },
        }
    }
}

/// Fields extracted from a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceData {
    pub invoice_id: String,
    pub event: InvoiceEvent,
    pub duration: WashDuration,
}

impl InvoiceData {
    /// Parse a webhook body. Without `metadata.washDuration` the amount is
    /// used at 1 sat = 1 s, capped at `max_wash_duration`.
    pub fn parse(body: &[u8], max_wash_duration: u32) -> Result<Self, serde_json::Error> {
        let payload: WebhookPayload = serde_json::from_slice(body)?;

        let mut duration =
            WashDuration::from_metadata(payload.metadata.and_then(|metadata| metadata.wash_duration));
        if duration == WashDuration::Seconds(0)
            && let Some(amount) = payload.amount
            && amount.is_finite()
        {
            duration = WashDuration::Seconds((amount as i64).min(i64::from(max_wash_duration)));
        }

        Ok(Self {
            event: InvoiceEvent::from(payload.event_type.as_str()),
            invoice_id: payload.invoice_id,
            duration,
        })
    }
}

/// Check a `sha256=<hex>` signature header against HMAC-SHA256 of `body`.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(hex) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Some(tag) = decode_tag(hex) else {
        return false;
    };
    hmac_sha256::HMAC::verify(body, secret, &tag)
}

/// Format the signature header BTCPay would send for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mac = hmac_sha256::HMAC::mac(body, secret);
    let hex: String = mac.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}

fn decode_tag(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 || !hex.is_ascii() {
        return None;
    }
    let mut tag = [0u8; 32];
    for (i, byte) in tag.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(tag)
}

pub struct WebhookHandler {
    config: WebhookConfig,
    tracker: Arc<InvoiceTracker>,
    max_wash_duration: u32,
}

impl WebhookHandler {
    pub fn new(config: WebhookConfig, tracker: Arc<InvoiceTracker>, max_wash_duration: u32) -> Self {
        Self {
            config,
            tracker,
            max_wash_duration,
        }
    }

    /// Authenticate and act on one webhook delivery.
    pub fn handle(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookOutcome, WebhookError> {
        if !self.config.enabled {
            return Err(WebhookError::Disabled);
        }
        if !verify_signature(self.config.secret.as_bytes(), body, signature) {
            warn!("[Webhook] Invalid BTCPay webhook signature");
            return Err(WebhookError::InvalidSignature);
        }

        let invoice = InvoiceData::parse(body, self.max_wash_duration)?;
        match invoice.event {
            InvoiceEvent::Settled => self.handle_settled(invoice),
            InvoiceEvent::Refunded => self.handle_refunded(invoice),
            InvoiceEvent::Other(event_type) => {
                info!("[Webhook] Unhandled BTCPay event type: {}", event_type);
                Ok(WebhookOutcome::Ignored { event_type })
            }
        }
    }

    fn handle_settled(&self, invoice: InvoiceData) -> Result<WebhookOutcome, WebhookError> {
        let seconds = match &invoice.duration {
            WashDuration::Seconds(seconds) => u32::try_from(*seconds).ok().filter(|s| *s > 0),
            WashDuration::Malformed(_) => None,
        };
        let Some(duration) = seconds else {
            let shown = match invoice.duration {
                WashDuration::Seconds(seconds) => seconds.to_string(),
                WashDuration::Malformed(raw) => raw,
            };
            warn!("[Webhook] Invalid duration for invoice {}: {}", invoice.invoice_id, shown);
            return Err(WebhookError::InvalidDuration {
                invoice_id: invoice.invoice_id,
                duration: shown,
            });
        };

        self.tracker
            .settle(&invoice.invoice_id, duration)
            .map_err(|reason| WebhookError::Refused {
                action: "start",
                reason,
            })?;
        Ok(WebhookOutcome::Started {
            invoice_id: invoice.invoice_id,
            duration,
        })
    }

    fn handle_refunded(&self, invoice: InvoiceData) -> Result<WebhookOutcome, WebhookError> {
        self.tracker
            .refund(&invoice.invoice_id)
            .map_err(|reason| WebhookError::Refused {
                action: "stop",
                reason,
            })?;
        Ok(WebhookOutcome::Stopped {
            invoice_id: invoice.invoice_id,
        })
    }
}
