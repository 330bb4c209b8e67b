//! Operator commands: start, add time, stop, status.
//!
//! Commands arrive as JSON bodies `{"secret": "...", "duration": 60}` and
//! get a reply carrying an HTTP-style status code, so the same service can
//! sit behind MQTT (see [`crate::input::mqtt`]) or any other transport.

use crate::controller::ActivationController;
use crate::error::Rejected;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Operator-facing actions, named after their endpoint paths.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OperatorAction {
    StartWash,
    AddTime,
    StopWash,
    Status,
}

impl OperatorAction {
    /// Everything except `status` needs the shared secret.
    pub fn is_privileged(self) -> bool {
        !matches!(self, Self::Status)
    }
}

#[derive(Debug, Default, Deserialize)]
struct OperatorRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    /// Kept loose so non-integers are reported as invalid durations rather
    /// than parse failures.
    #[serde(default)]
    duration: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorReply {
    pub action: OperatorAction,
    /// Echo of the request `id`, for correlating replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: u16,
    pub body: Value,
}

impl OperatorReply {
    fn new(action: OperatorAction, id: Option<String>, code: u16, body: Value) -> Self {
        Self {
            action,
            id,
            code,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Executes operator commands against the controller.
#[derive(Clone)]
pub struct OperatorService {
    controller: ActivationController,
    secret_key: String,
}

impl OperatorService {
    pub fn new(controller: ActivationController, secret_key: impl Into<String>) -> Self {
        Self {
            controller,
            secret_key: secret_key.into(),
        }
    }

    pub fn controller(&self) -> &ActivationController {
        &self.controller
    }

    /// Run `action` with the raw JSON `payload` (may be empty for `status`).
    pub fn handle(&self, action: OperatorAction, payload: &[u8]) -> OperatorReply {
        let request = if payload.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            serde_json::from_slice::<OperatorRequest>(payload).ok()
        };
        let id = request.as_ref().and_then(|r| r.id.clone());

        let authorized = request
            .as_ref()
            .is_some_and(|r| r.secret.as_deref() == Some(self.secret_key.as_str()));
        let request = request.unwrap_or_default();
        if action.is_privileged() && !authorized {
            warn!("[Operator] Rejected {}: missing or invalid secret", action);
            return OperatorReply::new(
                action,
                id,
                403,
                json!({"error": "Unauthorized access or invalid secret key"}),
            );
        }

        match action {
            OperatorAction::StartWash => self.with_duration(action, id, &request, |d| {
                match self.controller.start(d) {
                    Ok(()) => (200, json!({"status": "Wash started"})),
                    Err(Rejected::InvalidDuration { .. }) => invalid_duration(self.max()),
                    Err(_) => (409, json!({"error": "Washing machine already in use"})),
                }
            }),
            OperatorAction::AddTime => self.with_duration(action, id, &request, |d| {
                match self.controller.extend(d) {
                    Ok(()) => (200, json!({"status": "Time added to the running wash"})),
                    Err(Rejected::InvalidDuration { .. }) => invalid_duration(self.max()),
                    Err(_) => (404, json!({"error": "No wash running to add time to"})),
                }
            }),
            OperatorAction::StopWash => match self.controller.stop() {
                Ok(()) => OperatorReply::new(action, id, 200, json!({"status": "Stop signal sent"})),
                Err(_) => {
                    OperatorReply::new(action, id, 404, json!({"status": "No wash running to stop"}))
                }
            },
            OperatorAction::Status => {
                OperatorReply::new(action, id, 200, json!(self.controller.status()))
            }
        }
    }

    fn max(&self) -> u32 {
        self.controller.max_wash_duration()
    }

    /// Validate the `duration` field before handing it to `run`.
    fn with_duration(
        &self,
        action: OperatorAction,
        id: Option<String>,
        request: &OperatorRequest,
        run: impl FnOnce(u32) -> (u16, Value),
    ) -> OperatorReply {
        let duration = request
            .duration
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|d| u32::try_from(d).ok())
            .filter(|d| (1..=self.max()).contains(d));

        let (code, body) = match duration {
            Some(d) => {
                info!("[Operator] {} for {}s", action, d);
                run(d)
            }
            None => invalid_duration(self.max()),
        };
        OperatorReply::new(action, id, code, body)
    }
}

fn invalid_duration(max: u32) -> (u16, Value) {
    (
        400,
        json!({"error": format!("Invalid duration. Must be an integer between 1 and {max} seconds.")}),
    )
}
