//! Relay adapters for the washing machine output pin.
//!
//! - [`SysfsRelay`] drives a real pin through the Linux sysfs GPIO interface.
//! - [`SimulatedRelay`] only logs transitions, for running off-device.

use super::Actuator;
use crate::error::DeviceError;
use log::info;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Relay wired to a GPIO pin, driven through `/sys/class/gpio`.
///
/// The pin is exported and configured as an output on construction, and
/// starts low so the machine is never powered by a stale level.
pub struct SysfsRelay {
    pin: u32,
    value_path: PathBuf,
}

impl SysfsRelay {
    pub fn new(pin: u32) -> Result<Self, DeviceError> {
        Self::with_root(SYSFS_GPIO_ROOT, pin)
    }

    /// Open the pin under a custom sysfs root.
    pub fn with_root(root: impl AsRef<Path>, pin: u32) -> Result<Self, DeviceError> {
        let root = root.as_ref();
        let pin_dir = root.join(format!("gpio{pin}"));
        let gpio_err = |source| DeviceError::Gpio { pin, source };

        if !pin_dir.exists() {
            fs::write(root.join("export"), pin.to_string()).map_err(gpio_err)?;
        }
        fs::write(pin_dir.join("direction"), "out").map_err(gpio_err)?;

        let relay = Self {
            pin,
            value_path: pin_dir.join("value"),
        };
        relay.set(false)?;
        info!("[Relay] GPIO {} initialized as output (low)", pin);
        Ok(relay)
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }
}

impl Actuator for SysfsRelay {
    fn set(&self, on: bool) -> Result<(), DeviceError> {
        fs::write(&self.value_path, if on { "1" } else { "0" }).map_err(|source| {
            DeviceError::Gpio {
                pin: self.pin,
                source,
            }
        })
    }
}

/// Relay that logs pin writes instead of touching hardware.
///
/// Keeps every level it was driven to, which simulation tooling and tests
/// use to check the on/off sequence.
pub struct SimulatedRelay {
    pin: u32,
    writes: Mutex<Vec<bool>>,
}

impl SimulatedRelay {
    pub fn new(pin: u32) -> Self {
        info!("[Relay] GPIO {} simulated, writes are logged only", pin);
        Self {
            pin,
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Last level written (low if never written).
    pub fn is_on(&self) -> bool {
        self.writes.lock().last().copied().unwrap_or(false)
    }

    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().clone()
    }
}

impl Actuator for SimulatedRelay {
    fn set(&self, on: bool) -> Result<(), DeviceError> {
        info!(
            "[Relay] GPIO {}: {}",
            self.pin,
            if on { "ON (HIGH)" } else { "OFF (LOW)" }
        );
        self.writes.lock().push(on);
        Ok(())
    }
}
