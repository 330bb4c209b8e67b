//! `"<pin>-<seconds>"` activation messages.

use crate::controller::ActivationController;
use crate::error::Rejected;
use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchMessageError {
    #[error("unrecognized message format: {0}")]
    Unrecognized(String),

    #[error("invalid pin: {0}")]
    InvalidPin(String),

    #[error("invalid duration format: {0}")]
    InvalidDuration(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error(transparent)]
    Message(#[from] SwitchMessageError),

    #[error("command for pin {pin}, but our relay is on pin {relay_pin}")]
    OtherPin { pin: u32, relay_pin: u32 },

    #[error("washing machine refused: {0}")]
    Refused(#[from] Rejected),
}

/// A parsed activation request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchCommand {
    pub pin: u32,
    /// Seconds as sent; may be fractional.
    pub seconds: f64,
}

impl SwitchCommand {
    pub fn parse(message: &str) -> Result<Self, SwitchMessageError> {
        let message = message.trim();
        let mut parts = message.split('-');
        let (Some(pin), Some(seconds), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(SwitchMessageError::Unrecognized(message.to_string()));
        };

        let pin = pin
            .trim()
            .parse()
            .map_err(|_| SwitchMessageError::InvalidPin(pin.to_string()))?;
        let seconds: f64 = seconds
            .trim()
            .parse()
            .map_err(|_| SwitchMessageError::InvalidDuration(seconds.to_string()))?;
        if !seconds.is_finite() {
            return Err(SwitchMessageError::InvalidDuration(seconds.to_string()));
        }

        Ok(Self { pin, seconds })
    }

    /// Whole seconds to wash, capped at `max_wash_duration`.
    pub fn wash_seconds(&self, max_wash_duration: u32) -> u32 {
        self.seconds.min(f64::from(max_wash_duration)).max(0.0) as u32
    }
}

/// Routes switch messages for `relay_pin` to the controller.
#[derive(Clone)]
pub struct SwitchHandler {
    relay_pin: u32,
    controller: ActivationController,
}

impl SwitchHandler {
    pub fn new(relay_pin: u32, controller: ActivationController) -> Self {
        Self {
            relay_pin,
            controller,
        }
    }

    /// Start (or top up) the machine for one message.
    pub fn handle_message(&self, message: &str) -> Result<u32, SwitchError> {
        let command = SwitchCommand::parse(message)?;
        if command.pin != self.relay_pin {
            return Err(SwitchError::OtherPin {
                pin: command.pin,
                relay_pin: self.relay_pin,
            });
        }

        let max = self.controller.max_wash_duration();
        if command.seconds > f64::from(max) {
            warn!(
                "[Switch] Duration {} exceeds maximum allowed ({}), capping",
                command.seconds, max
            );
        }
        let duration = command.wash_seconds(max);

        info!("[Switch] Starting wash cycle for {} seconds", duration);
        self.controller.start(duration)?;
        Ok(duration)
    }
}
