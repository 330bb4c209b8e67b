//! Activation controller: the single owner of the washing machine relay.
//!
//! Arbitrates concurrent `start` / `extend` / `stop` requests from every
//! trigger source, runs each Busy period as one cancellable background task,
//! and folds the external coin switch into every status read.
//!
//! All reservation fields sit behind one `parking_lot::Mutex`. The lock is
//! never held across relay writes or the sensor read.

mod countdown;
mod events;
mod state;

pub use countdown::{Countdown, CountdownWait, WakeReason};
pub use events::{CycleEvent, FinishReason};
pub use state::{Phase, StatusReport};

use crate::device::{Actuator, SensorReader};
use crate::error::Rejected;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use state::{ActiveCycle, PendingCycle, ReservationState};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 16;

struct Inner {
    actuator: Arc<dyn Actuator>,
    sensor: Arc<dyn SensorReader>,
    max_wash_duration: u32,
    state: Mutex<ReservationState>,
    events: broadcast::Sender<CycleEvent>,
    runtime: Handle,
}

/// Cheap to clone; every clone drives the same reservation.
#[derive(Clone)]
pub struct ActivationController {
    inner: Arc<Inner>,
}

impl ActivationController {
    /// Create an Idle controller.
    ///
    /// Countdown tasks are spawned on the current Tokio runtime, so this must
    /// be called from within one. The controller methods themselves can then
    /// be called from any thread.
    pub fn new(
        actuator: Arc<dyn Actuator>,
        sensor: Arc<dyn SensorReader>,
        max_wash_duration: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                actuator,
                sensor,
                max_wash_duration,
                state: Mutex::new(ReservationState::default()),
                events,
                runtime: Handle::current(),
            }),
        }
    }

    pub fn max_wash_duration(&self) -> u32 {
        self.inner.max_wash_duration
    }

    /// Receive cycle lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.inner.events.subscribe()
    }

    /// Reserve the machine for `duration` seconds.
    ///
    /// A machine already running is topped up exactly as [`extend`] would.
    /// The relay is switched on by the countdown task shortly after this
    /// returns.
    ///
    /// [`extend`]: Self::extend
    pub fn start(&self, duration: u32) -> Result<(), Rejected> {
        self.start_cycle(duration).map(drop)
    }

    /// [`start`](Self::start), returning the id of the cycle the time went
    /// to.
    ///
    /// A start that lands while a cycle is switching the relay off is
    /// queued as the next cycle, which begins as soon as the off-write is
    /// done.
    pub fn start_cycle(&self, duration: u32) -> Result<u64, Rejected> {
        self.inner.validate(duration)?;

        if self.inner.sensor.is_engaged_externally() {
            info!("[Wash] Start refused: machine held by the external switch");
            return Err(Rejected::ExternallyOccupied);
        }

        let mut state = self.inner.state.lock();
        let next_id = state.next_cycle_id;
        match state.cycle.as_mut() {
            Some(cycle) if cycle.closing => {
                let successor = cycle.successor.get_or_insert(PendingCycle {
                    id: next_id,
                    duration: 0,
                });
                successor.duration = successor.duration.saturating_add(duration);
                let id = successor.id;
                if id == next_id {
                    state.next_cycle_id += 1;
                }
                info!("[Wash] Cycle ending, queued {}s for cycle {}", duration, id);
                return Ok(id);
            }
            Some(_) => {
                info!("[Wash] Already running, adding {}s instead", duration);
                return self.inner.extend_locked(&mut state, duration);
            }
            None => {}
        }

        state.next_cycle_id += 1;
        let wait = self.inner.install_cycle(&mut state, next_id, duration);
        drop(state);

        info!("[Wash] Cycle {} locked for {}s", next_id, duration);
        let inner = self.inner.clone();
        self.inner.runtime.spawn(inner.run_cycle(next_id, wait));
        Ok(next_id)
    }

    /// Add `duration` seconds to the running cycle, preserving the time left.
    pub fn extend(&self, duration: u32) -> Result<(), Rejected> {
        self.inner.validate(duration)?;

        let mut state = self.inner.state.lock();
        self.inner.extend_locked(&mut state, duration).map(drop)
    }

    /// Ask the running cycle to end early.
    ///
    /// Returns as soon as the cancel signal is raised; the relay goes off and
    /// the phase returns to Idle when the countdown task observes it. A
    /// cycle queued behind a closing one is dropped as well.
    pub fn stop(&self) -> Result<(), Rejected> {
        let mut state = self.inner.state.lock();
        let Some(cycle) = state.cycle.as_mut() else {
            info!("[Wash] Stop requested but nothing is running");
            return Err(Rejected::NothingRunning);
        };
        warn!("[Wash] Stop requested for cycle {}", cycle.id);
        cycle.successor = None;
        cycle.countdown.cancel();
        Ok(())
    }

    /// Stop only if cycle `id` is the one running (or queued to run next).
    pub fn stop_cycle(&self, id: u64) -> Result<(), Rejected> {
        let mut state = self.inner.state.lock();
        let Some(cycle) = state.cycle.as_mut() else {
            return Err(Rejected::NothingRunning);
        };
        if cycle.successor.is_some_and(|next| next.id == id) {
            warn!("[Wash] Stop requested for queued cycle {}", id);
            cycle.successor = None;
            return Ok(());
        }
        if cycle.id != id {
            info!("[Wash] Stop requested for cycle {}, which is not running", id);
            return Err(Rejected::NothingRunning);
        }
        warn!("[Wash] Stop requested for cycle {}", id);
        cycle.countdown.cancel();
        Ok(())
    }

    /// Whether cycle `id` is running or queued to run next.
    pub fn is_cycle_live(&self, id: u64) -> bool {
        let state = self.inner.state.lock();
        state.cycle.as_ref().is_some_and(|cycle| {
            (cycle.id == id && !cycle.closing) || cycle.successor.is_some_and(|next| next.id == id)
        })
    }

    /// Current occupancy, with the remaining time recomputed on every call.
    ///
    /// An engaged external switch reports Busy even while the controller is
    /// Idle; its remaining time is unknown and reported as 0. While a cycle
    /// is closing with another queued behind it, the queued one is reported.
    pub fn status(&self) -> StatusReport {
        let engaged_externally = self.inner.sensor.is_engaged_externally();

        let state = self.inner.state.lock();
        match state.cycle.as_ref() {
            Some(ActiveCycle {
                successor: Some(next),
                ..
            }) => StatusReport {
                phase: Phase::Busy,
                remaining_seconds: u64::from(next.duration),
                total_duration: next.duration,
            },
            Some(cycle) => StatusReport {
                phase: Phase::Busy,
                remaining_seconds: cycle.remaining_seconds(Instant::now()),
                total_duration: cycle.total_duration,
            },
            None if engaged_externally => StatusReport {
                phase: Phase::Busy,
                remaining_seconds: 0,
                total_duration: 0,
            },
            None => StatusReport::IDLE,
        }
    }

    /// Internal phase, ignoring the external switch.
    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase()
    }

    /// Stop any running cycle and wait up to `timeout` for the relay to go
    /// off. If the countdown task does not finish in time the relay is
    /// forced off directly.
    pub async fn shutdown(&self, timeout: Duration) {
        let mut events = self.subscribe();
        if self.stop().is_err() {
            return;
        }

        let finished = async {
            loop {
                match events.recv().await {
                    Ok(CycleEvent::Finished { .. }) | Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        };

        if tokio::time::timeout(timeout, finished).await.is_err() {
            warn!("[Wash] Cycle did not finish within {:?}, forcing relay off", timeout);
            if let Err(e) = self.inner.actuator.set(false) {
                error!("[Relay] Failed to force relay off: {}", e);
            }
        }
    }
}

impl Inner {
    fn validate(&self, duration: u32) -> Result<(), Rejected> {
        if duration == 0 || duration > self.max_wash_duration {
            warn!(
                "[Wash] Invalid duration {}s, must be between 1 and {}",
                duration, self.max_wash_duration
            );
            return Err(Rejected::InvalidDuration {
                max: self.max_wash_duration,
            });
        }
        Ok(())
    }

    /// Make cycle `id` the current one and announce it.
    fn install_cycle(&self, state: &mut ReservationState, id: u64, duration: u32) -> CountdownWait {
        let end_time = Instant::now() + Duration::from_secs(u64::from(duration));
        let (countdown, wait) = Countdown::arm(end_time);
        state.cycle = Some(ActiveCycle {
            id,
            end_time,
            total_duration: duration,
            countdown,
            closing: false,
            successor: None,
        });
        self.publish(CycleEvent::Started {
            cycle: id,
            duration,
        });
        wait
    }

    /// Top up the running cycle, or the one queued behind a closing cycle.
    fn extend_locked(&self, state: &mut ReservationState, duration: u32) -> Result<u64, Rejected> {
        let Some(cycle) = state.cycle.as_mut() else {
            info!("[Wash] Nothing running to add time to");
            return Err(Rejected::NothingRunning);
        };

        if cycle.closing {
            let Some(next) = cycle.successor.as_mut() else {
                info!("[Wash] Cycle {} is ending, nothing to add time to", cycle.id);
                return Err(Rejected::NothingRunning);
            };
            next.duration = next.duration.saturating_add(duration);
            info!("[Wash] Added {}s to queued cycle {}", duration, next.id);
            return Ok(next.id);
        }

        let now = Instant::now();
        let remaining = cycle.end_time.saturating_duration_since(now);
        cycle.end_time = now + remaining + Duration::from_secs(u64::from(duration));
        cycle.total_duration = cycle.total_duration.saturating_add(duration);
        cycle.countdown.rearm(cycle.end_time);

        info!(
            "[Wash] Added {}s to cycle {}, {}s remaining",
            duration,
            cycle.id,
            cycle.remaining_seconds(now)
        );
        self.publish(CycleEvent::Extended {
            cycle: cycle.id,
            added: duration,
            total: cycle.total_duration,
        });
        Ok(cycle.id)
    }

    /// Called with the state lock held so subscribers see events in the
    /// order the transitions happened.
    fn publish(&self, event: CycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Body of the countdown task, starting with cycle `id`. Runs any
    /// cycle queued while the previous one was closing before returning.
    async fn run_cycle(self: Arc<Self>, mut id: u64, mut wait: CountdownWait) {
        loop {
            if let Err(e) = self.actuator.set(true) {
                error!("[Relay] Failed to switch relay on for cycle {}: {}", id, e);
            }

            let reason = loop {
                let wake = wait.wait().await;
                if let Some(reason) = self.begin_finish(id, wake) {
                    break reason;
                }
                debug!("[Wash] Cycle {} was extended while waking, sleeping again", id);
            };

            if let Err(e) = self.actuator.set(false) {
                error!(
                    "[Relay] Failed to switch relay off for cycle {}: {}; resetting to idle anyway",
                    id, e
                );
            }

            let next = {
                let mut state = self.state.lock();
                match state.cycle_mut(id) {
                    Some(cycle) => {
                        let successor = cycle.successor.take();
                        state.cycle = None;
                        self.publish(CycleEvent::Finished { cycle: id, reason });
                        successor.map(|next| {
                            (next.id, self.install_cycle(&mut state, next.id, next.duration))
                        })
                    }
                    None => None,
                }
            };
            match reason {
                FinishReason::Stopped => info!("[Wash] Cycle {} stopped early", id),
                FinishReason::Expired => info!("[Wash] Cycle {} finished", id),
            }

            let Some((next_id, next_wait)) = next else {
                info!("[Wash] Now idle");
                break;
            };
            info!("[Wash] Starting queued cycle {}", next_id);
            id = next_id;
            wait = next_wait;
        }
    }

    /// Decide under the lock whether a wake-up ends the cycle. Once this
    /// returns `Some`, the cycle is marked closing and further time goes to
    /// a queued successor instead.
    fn begin_finish(&self, id: u64, wake: WakeReason) -> Option<FinishReason> {
        let mut state = self.state.lock();
        let Some(cycle) = state.cycle_mut(id) else {
            return Some(FinishReason::Stopped);
        };

        let reason = if wake == WakeReason::Cancelled || cycle.countdown.is_cancelled() {
            FinishReason::Stopped
        } else if cycle.end_time > Instant::now() {
            return None;
        } else {
            FinishReason::Expired
        };
        cycle.closing = true;
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ManualSwitch, SimulatedRelay};
    use crate::error::DeviceError;
    use tokio_test::{assert_err, assert_ok};

    struct Rig {
        controller: ActivationController,
        relay: Arc<SimulatedRelay>,
        switch: Arc<ManualSwitch>,
    }

    fn rig(max: u32) -> Rig {
        let relay = Arc::new(SimulatedRelay::new(17));
        let switch = Arc::new(ManualSwitch::new(false));
        let controller = ActivationController::new(relay.clone(), switch.clone(), max);
        Rig {
            controller,
            relay,
            switch,
        }
    }

    /// Let spawned countdown tasks run without moving the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_from_idle() {
        let rig = rig(3600);
        assert_eq!(rig.controller.status(), StatusReport::IDLE);

        assert_ok!(rig.controller.start(120));
        let status = rig.controller.status();
        assert_eq!(status.phase, Phase::Busy);
        assert_eq!(status.total_duration, 120);
        assert_eq!(status.remaining_seconds, 120);

        settle().await;
        assert!(rig.relay.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_bounds() {
        let rig = rig(3600);
        assert_eq!(
            rig.controller.start(0),
            Err(Rejected::InvalidDuration { max: 3600 })
        );
        assert_eq!(
            rig.controller.start(3601),
            Err(Rejected::InvalidDuration { max: 3600 })
        );
        assert_eq!(rig.controller.phase(), Phase::Idle);

        assert_ok!(rig.controller.start(3600));
        assert_eq!(
            rig.controller.extend(0),
            Err(Rejected::InvalidDuration { max: 3600 })
        );
        assert_eq!(rig.controller.status().total_duration, 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_extend_stop_scenario() {
        let rig = rig(3600);

        assert_ok!(rig.controller.start(120));
        assert_eq!(
            rig.controller.status(),
            StatusReport {
                phase: Phase::Busy,
                remaining_seconds: 120,
                total_duration: 120
            }
        );

        assert_ok!(rig.controller.extend(30));
        assert_eq!(
            rig.controller.status(),
            StatusReport {
                phase: Phase::Busy,
                remaining_seconds: 150,
                total_duration: 150
            }
        );

        assert_ok!(rig.controller.stop());
        // Not necessarily idle yet, the task resets asynchronously
        settle().await;
        assert_eq!(rig.controller.status(), StatusReport::IDLE);
        assert_eq!(rig.relay.writes(), vec![true, false]);
        assert_eq!(rig.controller.stop(), Err(Rejected::NothingRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_preserves_remaining_time() {
        let rig = rig(3600);
        assert_ok!(rig.controller.start(100));

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(rig.controller.status().remaining_seconds, 60);

        assert_ok!(rig.controller.extend(25));
        let status = rig.controller.status();
        assert_eq!(status.remaining_seconds, 85);
        assert_eq!(status.total_duration, 125);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_busy_tops_up() {
        let by_start = rig(3600);
        let by_extend = rig(3600);

        assert_ok!(by_start.controller.start(60));
        assert_ok!(by_extend.controller.start(60));
        assert_ok!(by_start.controller.start(45));
        assert_ok!(by_extend.controller.extend(45));

        assert_eq!(by_start.controller.status(), by_extend.controller.status());
        assert_eq!(by_start.controller.status().total_duration, 105);

        // Still a single cycle: one on, one off
        tokio::time::sleep(Duration::from_secs(106)).await;
        settle().await;
        assert_eq!(by_start.relay.writes(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_reaches_sleeping_task() {
        let rig = rig(3600);
        assert_ok!(rig.controller.start(10));
        settle().await;

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_ok!(rig.controller.extend(20));

        // Original deadline passes, cycle keeps running
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rig.controller.phase(), Phase::Busy);
        assert!(rig.relay.is_on());
        assert_eq!(rig.controller.status().remaining_seconds, 17);

        tokio::time::sleep(Duration::from_secs(18)).await;
        settle().await;
        assert_eq!(rig.controller.phase(), Phase::Idle);
        assert!(!rig.relay.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_natural_expiry_emits_events() {
        let rig = rig(3600);
        let mut events = rig.controller.subscribe();

        assert_ok!(rig.controller.start(5));
        assert_eq!(
            events.recv().await.unwrap(),
            CycleEvent::Started {
                cycle: 0,
                duration: 5
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CycleEvent::Finished {
                cycle: 0,
                reason: FinishReason::Expired
            }
        );
        assert_eq!(rig.controller.status(), StatusReport::IDLE);
        assert!(!rig.relay.is_on());

        // A fresh cycle gets a fresh id
        assert_ok!(rig.controller.start(5));
        assert_eq!(events.recv().await.unwrap().cycle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_stopped() {
        let rig = rig(3600);
        let mut events = rig.controller.subscribe();
        assert_ok!(rig.controller.start(600));
        assert_ok!(rig.controller.stop());

        let _started = events.recv().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            CycleEvent::Finished {
                cycle: 0,
                reason: FinishReason::Stopped
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_extend_and_stop_are_rejected() {
        let rig = rig(3600);
        assert_eq!(rig.controller.extend(10), Err(Rejected::NothingRunning));
        assert_eq!(rig.controller.stop(), Err(Rejected::NothingRunning));
        assert_eq!(rig.controller.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_switch_blocks_start_in_any_phase() {
        let rig = rig(3600);
        rig.switch.set(true);
        assert_eq!(rig.controller.start(60), Err(Rejected::ExternallyOccupied));
        assert_eq!(rig.controller.phase(), Phase::Idle);

        rig.switch.set(false);
        assert_ok!(rig.controller.start(60));
        rig.switch.set(true);
        assert_eq!(rig.controller.start(60), Err(Rejected::ExternallyOccupied));
        assert_eq!(rig.controller.phase(), Phase::Busy);
        assert_eq!(rig.controller.status().total_duration, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_switch_reports_busy_while_idle() {
        let rig = rig(3600);
        rig.switch.set(true);
        assert_eq!(
            rig.controller.status(),
            StatusReport {
                phase: Phase::Busy,
                remaining_seconds: 0,
                total_duration: 0
            }
        );
        // Internal state untouched
        assert_eq!(rig.controller.phase(), Phase::Idle);
        assert_eq!(rig.controller.stop(), Err(Rejected::NothingRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reads_do_not_mutate() {
        let rig = rig(3600);
        assert_ok!(rig.controller.start(300));

        let mut previous = rig.controller.status();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(7)).await;
            let status = rig.controller.status();
            assert_eq!(status.phase, previous.phase);
            assert_eq!(status.total_duration, previous.total_duration);
            assert!(status.remaining_seconds <= previous.remaining_seconds);
            previous = status;
        }
    }

    struct FailingRelay;

    impl Actuator for FailingRelay {
        fn set(&self, _on: bool) -> Result<(), DeviceError> {
            Err(DeviceError::Gpio {
                pin: 17,
                source: std::io::Error::other("relay stuck"),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_failure_still_returns_to_idle() {
        let controller =
            ActivationController::new(Arc::new(FailingRelay), Arc::new(ManualSwitch::new(false)), 60);
        assert_ok!(controller.start(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(controller.phase(), Phase::Idle);
        assert_ok!(controller.start(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_running_cycle() {
        let rig = rig(3600);
        assert_ok!(rig.controller.start(600));
        settle().await;

        rig.controller.shutdown(Duration::from_secs(5)).await;
        assert_eq!(rig.controller.phase(), Phase::Idle);
        assert!(!rig.relay.is_on());

        // Nothing to do on an idle controller
        rig.controller.shutdown(Duration::from_secs(5)).await;
        assert_err!(rig.controller.stop());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_run_one_cycle() {
        let rig = rig(3600);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = rig.controller.clone();
            handles.push(tokio::spawn(async move { controller.start(10) }));
        }
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let status = rig.controller.status();
        assert_eq!(status.phase, Phase::Busy);
        assert_eq!(status.total_duration, 160);

        assert_ok!(rig.controller.stop());
        let mut events = rig.controller.subscribe();
        while rig.controller.phase() == Phase::Busy {
            let _ = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        }
        assert_eq!(rig.relay.writes(), vec![true, false]);
    }
    /// Relay whose off-write blocks until released, holding the cycle in
    /// its closing window.
    #[derive(Default)]
    struct GatedRelay {
        writes: Mutex<Vec<bool>>,
        off_pending: std::sync::atomic::AtomicBool,
        released: std::sync::atomic::AtomicBool,
    }

    impl GatedRelay {
        fn off_pending(&self) -> bool {
            self.off_pending.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn release(&self) {
            self.released.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl Actuator for GatedRelay {
        fn set(&self, on: bool) -> Result<(), DeviceError> {
            if !on {
                self.off_pending.store(true, std::sync::atomic::Ordering::SeqCst);
                while !self.released.load(std::sync::atomic::Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            self.writes.lock().push(on);
            Ok(())
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_while_relay_switches_off_queues_next_cycle() {
        let relay = Arc::new(GatedRelay::default());
        let controller =
            ActivationController::new(relay.clone(), Arc::new(ManualSwitch::new(false)), 3600);
        let mut events = controller.subscribe();

        let first = controller.start_cycle(1).unwrap();
        wait_until(|| relay.off_pending()).await;

        // Closing: still Busy, and new time is accepted rather than refused.
        assert!(controller.status().is_busy());
        let queued = controller.start_cycle(60).unwrap();
        assert_ne!(queued, first);
        assert_ok!(controller.extend(5));
        assert_eq!(controller.status().total_duration, 65);
        assert!(controller.is_cycle_live(queued));
        assert!(!controller.is_cycle_live(first));

        relay.release();
        wait_until(|| *relay.writes.lock() == vec![true, false, true]).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                CycleEvent::Started {
                    cycle: first,
                    duration: 1
                },
                CycleEvent::Finished {
                    cycle: first,
                    reason: FinishReason::Expired
                },
                CycleEvent::Started {
                    cycle: queued,
                    duration: 65
                },
            ]
        );
        assert_eq!(controller.phase(), Phase::Busy);
        assert_eq!(controller.status().total_duration, 65);
        assert_ok!(controller.stop_cycle(queued));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_drops_queued_cycle() {
        let relay = Arc::new(GatedRelay::default());
        let controller =
            ActivationController::new(relay.clone(), Arc::new(ManualSwitch::new(false)), 3600);

        assert_ok!(controller.start(1));
        wait_until(|| relay.off_pending()).await;
        assert_ok!(controller.start(60));
        assert_ok!(controller.stop());

        relay.release();
        wait_until(|| controller.phase() == Phase::Idle).await;
        assert_eq!(*relay.writes.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cycle_only_stops_that_cycle() {
        let rig = rig(3600);
        let first = rig.controller.start_cycle(30).unwrap();
        assert_eq!(rig.controller.start_cycle(30), Ok(first));

        assert_eq!(rig.controller.stop_cycle(first + 1), Err(Rejected::NothingRunning));
        assert_eq!(rig.controller.phase(), Phase::Busy);

        assert_ok!(rig.controller.stop_cycle(first));
        settle().await;
        assert_eq!(rig.controller.phase(), Phase::Idle);
        assert_eq!(rig.controller.stop_cycle(first), Err(Rejected::NothingRunning));

        let second = rig.controller.start_cycle(30).unwrap();
        assert!(second > first);
        assert!(!rig.controller.is_cycle_live(first));
        assert!(rig.controller.is_cycle_live(second));
    }
}
