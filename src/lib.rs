//! I2C sensor bridge library.
//!
//! Drivers for BME280, BH1750 and HTU21D environmental sensors sharing one
//! I2C bus, plus the configuration and polling layer used by the
//! `i2c-sensor-bridge` service.

pub mod bus;
pub mod config;
pub mod error;
pub mod instance_lock;
pub mod poller;
pub mod sensors;
pub mod units;
