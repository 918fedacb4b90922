//! Single instance lock using Unix socket.
//!
//! Prevents two bridge processes from driving the same I2C bus at once; their
//! trigger/read sequences would interleave on the wire. Uses a Unix socket
//! which is automatically cleaned up by the OS when the process dies, avoiding
//! stale lock files.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceLockError {
    /// Another instance is already polling this bus.
    #[error("another instance is already using {0}")]
    AlreadyRunning(String),

    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// The lock is held as long as this struct exists. When dropped, the socket
/// file is removed.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock for `bus_device`.
    pub fn acquire(bus_device: &Path) -> Result<Self, InstanceLockError> {
        Self::acquire_at(Self::socket_path(bus_device), bus_device)
    }

    fn acquire_at(path: PathBuf, bus_device: &Path) -> Result<Self, InstanceLockError> {
        let busy = || InstanceLockError::AlreadyRunning(bus_device.display().to_string());

        // A socket left behind by a SIGKILL'd process refuses connections.
        if path.exists() {
            match UnixStream::connect(&path) {
                Ok(_) => return Err(busy()),
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
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(busy()),
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Socket path for `bus_device`, under `XDG_RUNTIME_DIR` or `/tmp`.
    pub fn socket_path(bus_device: &Path) -> PathBuf {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        runtime_dir.join(socket_name(bus_device))
    }
}

/// `/dev/i2c-1` -> `i2c-sensor-bridge-i2c-1.sock`
fn socket_name(bus_device: &Path) -> String {
    let bus = bus_device
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bus".to_string());
    let bus: String = bus
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("i2c-sensor-bridge-{bus}.sock")
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("isb-lock-{}-{tag}.sock", std::process::id()))
    }

    #[test]
    fn test_socket_name_per_bus() {
        assert_eq!(
            socket_name(Path::new("/dev/i2c-1")),
            "i2c-sensor-bridge-i2c-1.sock"
        );
        assert_eq!(
            socket_name(Path::new("/dev/i2c.10")),
            "i2c-sensor-bridge-i2c_10.sock"
        );
        assert_eq!(socket_name(Path::new("/")), "i2c-sensor-bridge-bus.sock");
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let path = temp_socket("held");
        let device = Path::new("/dev/i2c-1");
        let lock = InstanceLock::acquire_at(path.clone(), device).unwrap();
        assert!(matches!(
            InstanceLock::acquire_at(path.clone(), device),
            Err(InstanceLockError::AlreadyRunning(_))
        ));

        drop(lock);
        assert!(!path.exists());
        let again = InstanceLock::acquire_at(path.clone(), device).unwrap();
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let path = temp_socket("stale");
        let _ = std::fs::remove_file(&path);
        std::fs::write(&path, b"").unwrap();
        let lock = InstanceLock::acquire_at(path.clone(), Path::new("/dev/i2c-1")).unwrap();
        assert!(lock.path().exists());
    }
}
