//! In-memory external switch.
//!
//! Stand-in for the coin/token switch when there is no status file to read,
//! as in tests and embedding code. Flip it from any thread with [`set`];
//! the controller reads it as a [`SensorReader`].
//!
//! [`set`]: ManualSwitch::set

use super::SensorReader;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ManualSwitch {
    engaged: AtomicBool,
}

impl ManualSwitch {
    pub fn new(engaged: bool) -> Self {
        Self {
            engaged: AtomicBool::new(engaged),
        }
    }

    pub fn get(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn set(&self, engaged: bool) {
        self.engaged.store(engaged, Ordering::SeqCst);
    }
}

impl Default for ManualSwitch {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SensorReader for ManualSwitch {
    fn is_engaged_externally(&self) -> bool {
        self.get()
    }
}
