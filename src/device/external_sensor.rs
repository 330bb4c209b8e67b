//! Coin-acceptor status file.
//!
//! The coin acceptor publishes its state by writing `ON` or `OFF` to a small
//! text file. The file is read on every [`SensorReader`] call, so there is no
//! cached state to drift.

use super::SensorReader;
use crate::error::DeviceError;
use log::warn;
use std::io;
use std::path::{Path, PathBuf};

pub struct StatusFileSensor {
    path: PathBuf,
}

impl StatusFileSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw state. A missing file means the acceptor is idle.
    pub fn read_state(&self) -> Result<bool, DeviceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().eq_ignore_ascii_case("on")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DeviceError::Sensor(e)),
        }
    }
}

impl SensorReader for StatusFileSensor {
    fn is_engaged_externally(&self) -> bool {
        match self.read_state() {
            Ok(engaged) => engaged,
            Err(e) => {
                warn!("[Sensor] {}: {}, treating as idle", self.path.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_not_engaged() {
        let dir = tempfile::tempdir().unwrap();
        let sensor = StatusFileSensor::new(dir.path().join("external_status.txt"));
        assert!(!sensor.is_engaged_externally());
    }

    #[test]
    fn test_on_is_engaged_regardless_of_case_and_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("external_status.txt");
        let sensor = StatusFileSensor::new(&path);

        std::fs::write(&path, "ON\n").unwrap();
        assert!(sensor.is_engaged_externally());

        std::fs::write(&path, "  on ").unwrap();
        assert!(sensor.is_engaged_externally());

        std::fs::write(&path, "OFF").unwrap();
        assert!(!sensor.is_engaged_externally());

        std::fs::write(&path, "").unwrap();
        assert!(!sensor.is_engaged_externally());
    }

    #[test]
    fn test_unreadable_path_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        // Reading a directory as a file is an I/O error other than NotFound
        let sensor = StatusFileSensor::new(dir.path());
        assert!(sensor.read_state().is_err());
        assert!(!sensor.is_engaged_externally());
    }
}
