//! Hardware capabilities consumed by the activation controller.
//!
//! The controller only ever sees the two traits below. Concrete adapters
//! (sysfs GPIO, simulation, coin-acceptor status file) live in the
//! submodules and are picked in `main` from configuration.

pub mod external_sensor;
pub mod manual_switch;
pub mod relay;

use crate::error::DeviceError;

pub use external_sensor::StatusFileSensor;
pub use manual_switch::ManualSwitch;
pub use relay::{SimulatedRelay, SysfsRelay};

/// Physical on/off output driving the washing machine relay.
///
/// Called from the countdown task, so implementations must be `Send + Sync`
/// and should return quickly.
pub trait Actuator: Send + Sync {
    fn set(&self, on: bool) -> Result<(), DeviceError>;
}

/// Read-only signal telling whether something outside this process
/// (the manual coin/token switch) currently holds the machine.
///
/// Must not block. Implementations report read failures as `false`.
pub trait SensorReader: Send + Sync {
    fn is_engaged_externally(&self) -> bool;
}

