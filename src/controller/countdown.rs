//! Re-armable, cancellable countdown.
//!
//! [`Countdown`] is the handle kept by the controller; [`CountdownWait`] is
//! moved into the background task. The deadline travels over a `watch`
//! channel so a sleeping task re-derives its wake time whenever the
//! controller pushes a new one, and cancellation is a `CancellationToken`.

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Why a [`CountdownWait::wait`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The current deadline passed.
    Expired,
    /// `cancel()` was called, or the handle was dropped.
    Cancelled,
}

/// Controller side of the countdown.
#[derive(Debug)]
pub struct Countdown {
    deadline: watch::Sender<Instant>,
    cancel: CancellationToken,
}

/// Task side of the countdown.
#[derive(Debug)]
pub struct CountdownWait {
    deadline: watch::Receiver<Instant>,
    cancel: CancellationToken,
}

impl Countdown {
    /// Arm a new countdown for `deadline`.
    pub fn arm(deadline: Instant) -> (Self, CountdownWait) {
        let (tx, rx) = watch::channel(deadline);
        let cancel = CancellationToken::new();
        (
            Self {
                deadline: tx,
                cancel: cancel.clone(),
            },
            CountdownWait {
                deadline: rx,
                cancel,
            },
        )
    }

    /// Move the deadline. A waiting task wakes and sleeps toward the new one.
    pub fn rearm(&self, deadline: Instant) {
        self.deadline.send_replace(deadline);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.borrow()
    }
}

impl CountdownWait {
    /// Sleep until the latest deadline or cancellation, whichever is first.
    ///
    /// Cancellation wins when both are ready.
    pub async fn wait(&mut self) -> WakeReason {
        loop {
            let deadline = *self.deadline.borrow_and_update();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return WakeReason::Cancelled,
                changed = self.deadline.changed() => {
                    if changed.is_err() {
                        return WakeReason::Cancelled;
                    }
                }
                _ = sleep_until(deadline) => return WakeReason::Expired,
            }
        }
    }
}
