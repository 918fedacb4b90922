use super::{HalBus, SharedBus};
use crate::error::BridgeError;
use linux_embedded_hal::I2cdev;
use log::info;
use std::path::Path;

/// Bus backed by a Linux i2c-dev character device (e.g. `/dev/i2c-1`).
pub type LinuxBus = HalBus<I2cdev>;

/// Open the i2c-dev device at `path` and wrap it for sharing between drivers.
pub fn open_linux_bus(path: &Path) -> Result<SharedBus<LinuxBus>, BridgeError> {
    let dev = I2cdev::new(path).map_err(|e| BridgeError::BusOpen {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    info!("Opened I2C bus {}", path.display());
    Ok(SharedBus::new(HalBus::new(dev)))
}
