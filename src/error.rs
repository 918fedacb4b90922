use embedded_hal::i2c::ErrorKind;
use thiserror::Error as ThisError;

use crate::sensors::{Quantity, TriggerState};

/// Failure of a single transaction on the I2C bus.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("no acknowledge from device at 0x{0:02x}")]
    NoAcknowledge(u8),

    #[error("i2c transfer with 0x{address:02x} failed: {kind:?}")]
    Transfer { address: u8, kind: ErrorKind },

    #[error("block write of {len} bytes to 0x{address:02x} exceeds the SMBus limit")]
    BlockTooLong { address: u8, len: usize },
}

impl BusError {
    /// Classify an embedded-hal error for the given device address.
    pub fn from_kind(address: u8, kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NoAcknowledge(_) => BusError::NoAcknowledge(address),
            kind => BusError::Transfer { address, kind },
        }
    }
}

#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("CRC mismatch on {quantity} channel")]
    Integrity { quantity: Quantity },

    #[error("{quantity} value {value:.2} outside the plausible range")]
    OutOfRange { quantity: Quantity, value: f64 },

    #[error("unexpected chip id 0x{found:02x} (expected 0x{expected:02x})")]
    UnexpectedChipId { expected: u8, found: u8 },

    #[error("conversion still running after the documented latency")]
    ConversionTimeout,

    #[error("sensor not detected")]
    NotDetected,

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: TriggerState, to: TriggerState },
}

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to open I2C bus {path}: {reason}")]
    BusOpen { path: String, reason: String },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    InstanceLock(#[from] crate::instance_lock::InstanceLockError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
