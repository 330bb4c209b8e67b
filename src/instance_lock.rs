//! Single instance lock using a Unix socket.
//!
//! Two controllers driving the same relay would fight over it, so only one
//! process may run at a time. The socket is released by the OS when the
//! process dies, so a crash never leaves a stale lock behind.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SOCKET_NAME: &str = "lightning-wash.sock";

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("another instance is already running")]
    AlreadyRunning,

    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Held for as long as the process should own the relay. The socket file is
/// removed on drop.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at the default [`socket_path`](Self::socket_path).
    pub fn acquire() -> Result<Self, InstanceLockError> {
        Self::acquire_at(Self::socket_path())
    }

    pub fn acquire_at(path: impl Into<PathBuf>) -> Result<Self, InstanceLockError> {
        let path = path.into();

        // A socket file nobody answers on was left by a SIGKILL'd process.
        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(InstanceLockError::AlreadyRunning);
            }
            let _ = std::fs::remove_file(&path);
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            // Lost a race with another instance between the check and bind.
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(InstanceLockError::AlreadyRunning),
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    /// `$XDG_RUNTIME_DIR/lightning-wash.sock`, falling back to `/tmp`.
    pub fn socket_path() -> PathBuf {
        socket_path_in(dirs::runtime_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn socket_path_in(runtime_dir: Option<PathBuf>) -> PathBuf {
    runtime_dir
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
