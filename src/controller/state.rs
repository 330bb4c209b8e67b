//! Reservation state owned by the activation controller.

use super::countdown::Countdown;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Occupancy of the machine as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Idle,
    Busy,
}

/// Snapshot returned by `status()`.
///
/// Serializes as `{"status": "busy", "remaining_time": 87, "total_duration": 120}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "status")]
    pub phase: Phase,
    #[serde(rename = "remaining_time")]
    pub remaining_seconds: u64,
    pub total_duration: u32,
}

impl StatusReport {
    pub const IDLE: Self = Self {
        phase: Phase::Idle,
        remaining_seconds: 0,
        total_duration: 0,
    };

    pub fn is_busy(&self) -> bool {
        self.phase == Phase::Busy
    }
}

/// One Busy period, from `start` until the countdown task resets it.
#[derive(Debug)]
pub(super) struct ActiveCycle {
    pub id: u64,
    pub end_time: Instant,
    pub total_duration: u32,
    pub countdown: Countdown,
    /// Set once the countdown task has committed to finishing. New time
    /// goes to `successor` from then on so none can be silently dropped.
    pub closing: bool,
    pub successor: Option<PendingCycle>,
}

/// Time bought while the current cycle was switching the relay off. The
/// countdown task starts it as a fresh cycle right after the off-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PendingCycle {
    pub id: u64,
    pub duration: u32,
}

impl ActiveCycle {
    /// Seconds left, rounded to the nearest second, never negative.
    pub fn remaining_seconds(&self, now: Instant) -> u64 {
        round_secs(self.end_time.saturating_duration_since(now))
    }
}

/// The single reservation. `cycle` is `None` exactly when Idle, which keeps
/// `end_time` and `total_duration` meaningless outside a Busy period.
#[derive(Debug, Default)]
pub(super) struct ReservationState {
    pub cycle: Option<ActiveCycle>,
    pub next_cycle_id: u64,
}

impl ReservationState {
    pub fn phase(&self) -> Phase {
        if self.cycle.is_some() {
            Phase::Busy
        } else {
            Phase::Idle
        }
    }

    /// The cycle with `id`, if it is still the current one.
    pub fn cycle_mut(&mut self, id: u64) -> Option<&mut ActiveCycle> {
        self.cycle.as_mut().filter(|cycle| cycle.id == id)
    }
}

fn round_secs(duration: Duration) -> u64 {
    duration.as_secs_f64().round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_secs() {
        assert_eq!(round_secs(Duration::ZERO), 0);
        assert_eq!(round_secs(Duration::from_millis(499)), 0);
        assert_eq!(round_secs(Duration::from_millis(500)), 1);
        assert_eq!(round_secs(Duration::from_millis(119_600)), 120);
    }

    #[test]
    fn test_status_report_wire_format() {
        let report = StatusReport {
            phase: Phase::Busy,
            remaining_seconds: 87,
            total_duration: 120,
        };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            serde_json::json!({"status": "busy", "remaining_time": 87, "total_duration": 120})
        );
        assert_eq!(Phase::Idle.to_string(), "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_seconds_never_negative() {
        let now = Instant::now();
        let (countdown, _wait) = Countdown::arm(now);
        let cycle = ActiveCycle {
            id: 0,
            end_time: now,
            total_duration: 10,
            countdown,
            closing: false,
            successor: None,
        };
        assert_eq!(cycle.remaining_seconds(now + Duration::from_secs(5)), 0);
    }
}
