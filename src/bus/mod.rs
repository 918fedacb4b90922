//! I2C bus transport.
//!
//! Drivers talk to their chips through the [`SmBus`] trait, which mirrors the
//! SMBus primitives exposed by the Linux i2c-dev interface. Any
//! `embedded_hal::i2c::I2c` implementation can be used through [`HalBus`].
//!
//! Several chips usually share one physical bus. [`SharedBus`] is the handle
//! each driver keeps; a driver locks it for the whole of one update so its
//! trigger/wait/read sequence is never interleaved with another device.

mod hal;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(test)]
pub mod mock;

pub use hal::HalBus;
#[cfg(target_os = "linux")]
pub use linux::{LinuxBus, open_linux_bus};

use crate::error::BusError;
use parking_lot::{Mutex, MutexGuard};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Lowest and highest 7-bit addresses that are not reserved.
pub const SCAN_RANGE: RangeInclusive<u8> = 0x08..=0x77;

/// SMBus-style register access.
///
/// # Safety Invariants
///
/// - Only one transaction may be in flight at a time
/// - Address must be 7-bit (valid range: 0x00..=0x7F)
pub trait SmBus {
    /// Send a single command byte.
    fn write_byte(&mut self, addr: u8, value: u8) -> Result<(), BusError>;

    /// Write `values` starting at `register` in one transaction.
    fn write_block(&mut self, addr: u8, register: u8, values: &[u8]) -> Result<(), BusError>;

    /// Plain read without a register phase.
    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), BusError>;

    /// Write `register`, then read `buf.len()` bytes with a repeated start.
    fn read_block(&mut self, addr: u8, register: u8, buf: &mut [u8]) -> Result<(), BusError>;

    fn write_byte_data(&mut self, addr: u8, register: u8, value: u8) -> Result<(), BusError> {
        self.write_block(addr, register, &[value])
    }

    fn read_byte(&mut self, addr: u8) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_byte_data(&mut self, addr: u8, register: u8) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read_block(addr, register, &mut buf)?;
        Ok(buf[0])
    }

    /// SMBus word read. The first byte on the wire is the low byte.
    fn read_word_data(&mut self, addr: u8, register: u8) -> Result<u16, BusError> {
        let mut buf = [0u8; 2];
        self.read_block(addr, register, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
}

/// Cloneable handle to a bus shared by several drivers.
pub struct SharedBus<B> {
    inner: Arc<Mutex<B>>,
}

impl<B> SharedBus<B> {
    pub fn new(bus: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    /// Take exclusive access to the bus until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, B> {
        self.inner.lock()
    }
}

impl<B> Clone for SharedBus<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Probe every address in `range` with a one-byte read and return the ones
/// that answered.
pub fn scan<B: SmBus + ?Sized>(bus: &mut B, range: RangeInclusive<u8>) -> Vec<u8> {
    range
        .filter(|&addr| {
            let mut probe = [0u8; 1];
            bus.read(addr, &mut probe).is_ok()
        })
        .collect()
}
