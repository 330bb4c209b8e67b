//! Lifecycle notifications published by the activation controller.

use serde::Serialize;

/// Why a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FinishReason {
    /// The countdown ran out.
    Expired,
    /// `stop()` cancelled it.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    Started { cycle: u64, duration: u32 },
    Extended { cycle: u64, added: u32, total: u32 },
    /// Relay is off and the controller is Idle again.
    Finished { cycle: u64, reason: FinishReason },
}

impl CycleEvent {
    pub fn cycle(&self) -> u64 {
        match self {
            Self::Started { cycle, .. }
            | Self::Extended { cycle, .. }
            | Self::Finished { cycle, .. } => *cycle,
        }
    }
}
