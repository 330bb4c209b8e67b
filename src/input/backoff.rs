//! Reconnect delays for outbound transport clients.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, then
//! optionally jittered. The base is derived from the attempt number alone,
//! so jitter never feeds back into later delays.

use rand::Rng;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct ReconnectBackoff {
    /// Delay before the first reconnect.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplicative growth per failed attempt.
    pub factor: f64,
    /// Spread delays over `[base/2, base]`.
    pub jitter: bool,
}

impl Default for ReconnectBackoff {
    /// 5 s, growing by 1.5× up to 5 minutes.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(5),
            max: Duration::from_secs(300),
            factor: 1.5,
            jitter: false,
        }
    }
}

impl ReconnectBackoff {
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay to wait before reconnect attempt `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };

        if self.jitter {
            equal_jitter(base)
        } else {
            base
        }
    }
}

/// `delay/2 + random[0, delay/2]`
fn equal_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
    let half = ms / 2;
    let spread = if half == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=half)
    };
    Duration::from_millis(half + spread)
}
