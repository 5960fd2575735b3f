//! Single instance lock using a Unix socket.
//!
//! One bridge process per Caseta bridge: two processes talking to the same
//! bridge would each publish every event. The socket is keyed by the bridge
//! address and is released by the OS when the process dies, so a crash
//! leaves no stale lock behind.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error types for instance lock operations.
#[derive(Debug, Error)]
pub enum InstanceLockError {
    /// Another instance is already running for this bridge.
    #[error("another instance is already running for this bridge ({0})")]
    AlreadyRunning(PathBuf),

    /// I/O error during lock acquisition.
    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Held for the lifetime of the process. Dropping it removes the socket.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock the runtime socket for `address`.
    pub fn acquire(address: &str) -> Result<Self, InstanceLockError> {
        Self::acquire_at(socket_path(address))
    }

    pub fn acquire_at(path: PathBuf) -> Result<Self, InstanceLockError> {
        // A socket file nobody answers on was left by a killed process
        if path.exists() {
            match UnixStream::connect(&path) {
                Ok(_) => return Err(InstanceLockError::AlreadyRunning(path)),
                Err(_) => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                Err(InstanceLockError::AlreadyRunning(path))
            }
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Socket for `address` under `$XDG_RUNTIME_DIR`, or `/tmp`.
pub fn socket_path(address: &str) -> PathBuf {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    socket_path_in(&dir, address)
}

pub fn socket_path_in(dir: &Path, address: &str) -> PathBuf {
    let key: String = address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!("lutron-mqtt-{key}.sock"))
}
