use serde::Serialize;
use thiserror::Error as ThisError;

/// Reasons the activation controller refuses a request.
///
/// None of these change the reservation state.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejected {
    /// Duration outside `1..=max_wash_duration`. Resubmit a valid value.
    #[error("invalid duration: must be an integer between 1 and {max} seconds")]
    InvalidDuration { max: u32 },

    /// The coin/token switch has claimed the machine. Retry later.
    #[error("machine is in use or under maintenance")]
    ExternallyOccupied,

    /// `extend` or `stop` issued with no active cycle.
    #[error("no wash cycle is running")]
    NothingRunning,
}

/// I/O failure talking to the relay or the external sensor.
#[derive(ThisError, Debug)]
pub enum DeviceError {
    #[error("GPIO pin {pin}: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("sensor read failed: {0}")]
    Sensor(#[source] std::io::Error),
}

#[derive(ThisError, Debug)]
pub enum WashError {
    #[error(transparent)]
    Rejected(#[from] Rejected),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("webhook error: {0}")]
    Webhook(#[from] crate::input::webhook::WebhookError),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid WebSocket URL: {0}")]
    InvalidWebSocketUrl(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WashError>;
