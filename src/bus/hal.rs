use super::SmBus;
use crate::error::BusError;
use embedded_hal::i2c::{Error as _, I2c};

/// Data bytes allowed in one SMBus block write.
pub const MAX_BLOCK_LEN: usize = 32;

/// [`SmBus`] on top of an embedded-hal 1.0 I2C bus.
pub struct HalBus<I2C> {
    i2c: I2C,
}

impl<I2C: I2c> HalBus<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    /// Release the underlying I2C bus
    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C: I2c> SmBus for HalBus<I2C> {
    fn write_byte(&mut self, addr: u8, value: u8) -> Result<(), BusError> {
        self.i2c
            .write(addr, &[value])
            .map_err(|e| BusError::from_kind(addr, e.kind()))
    }

    fn write_block(&mut self, addr: u8, register: u8, values: &[u8]) -> Result<(), BusError> {
        let len = values.len();
        if len > MAX_BLOCK_LEN {
            return Err(BusError::BlockTooLong { address: addr, len });
        }
        let mut frame = [0u8; MAX_BLOCK_LEN + 1];
        frame[0] = register;
        frame[1..=len].copy_from_slice(values);
        self.i2c
            .write(addr, &frame[..=len])
            .map_err(|e| BusError::from_kind(addr, e.kind()))
    }

    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.i2c
            .read(addr, buf)
            .map_err(|e| BusError::from_kind(addr, e.kind()))
    }

    fn read_block(&mut self, addr: u8, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.i2c
            .write_read(addr, &[register], buf)
            .map_err(|e| BusError::from_kind(addr, e.kind()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};

    /// Minimal I2C device that echoes a fixed response and records writes.
    struct ScriptedI2c {
        present: u8,
        response: Vec<u8>,
        written: Vec<(u8, Vec<u8>)>,
    }

    impl ErrorType for ScriptedI2c {
        type Error = ErrorKind;
    }

    impl I2c for ScriptedI2c {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if address != self.present {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            for op in operations {
                match op {
                    Operation::Write(data) => self.written.push((address, data.to_vec())),
                    Operation::Read(buf) => {
                        let n = buf.len().min(self.response.len());
                        buf[..n].copy_from_slice(&self.response[..n]);
                    }
                }
            }
            Ok(())
        }
    }

    fn scripted(response: &[u8]) -> HalBus<ScriptedI2c> {
        HalBus::new(ScriptedI2c {
            present: 0x40,
            response: response.to_vec(),
            written: Vec::new(),
        })
    }

    #[test]
    fn test_block_write_prefixes_register() {
        let mut bus = scripted(&[]);
        bus.write_block(0x40, 0xE6, &[0x02]).unwrap();
        let i2c = bus.release();
        assert_eq!(i2c.written, vec![(0x40, vec![0xE6, 0x02])]);
    }

    #[test]
    fn test_oversized_block_write_is_rejected() {
        let mut bus = scripted(&[]);
        bus.write_block(0x40, 0x00, &[0xAB; MAX_BLOCK_LEN]).unwrap();
        assert_eq!(
            bus.write_block(0x40, 0x00, &[0xAB; MAX_BLOCK_LEN + 1]),
            Err(BusError::BlockTooLong {
                address: 0x40,
                len: MAX_BLOCK_LEN + 1
            })
        );
        let written = bus.release().written;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1.len(), MAX_BLOCK_LEN + 1);
    }

    #[test]
    fn test_read_block_writes_register_then_reads() {
        let mut bus = scripted(&[0xAA, 0xBB, 0xCC]);
        let mut buf = [0u8; 3];
        bus.read_block(0x40, 0xE7, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0xCC]);
        assert_eq!(bus.release().written, vec![(0x40, vec![0xE7])]);
    }

    #[test]
    fn test_missing_device_maps_to_no_acknowledge() {
        let mut bus = scripted(&[]);
        assert_eq!(bus.write_byte(0x41, 0xFE), Err(BusError::NoAcknowledge(0x41)));
    }
}
