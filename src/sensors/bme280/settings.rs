//! BME280 register configuration.

use log::warn;
use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Oversampling {
    Skipped = 0,
    #[default]
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    /// Decode a raw register value, clamping anything above 16x.
    pub fn from_raw(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_else(|| {
            warn!("BME280 oversampling {raw} out of range, using x16");
            Oversampling::X16
        })
    }

    /// Number of samples averaged; 0 when the channel is skipped.
    pub fn factor(self) -> u32 {
        match self {
            Oversampling::Skipped => 0,
            other => 1 << (other as u8 - 1),
        }
    }

    pub fn enabled(self) -> bool {
        self != Oversampling::Skipped
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Mode {
    Sleep = 0,
    Forced = 1,
    #[default]
    Normal = 3,
}

impl Mode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Mode::Sleep,
            1 | 2 => Mode::Forced,
            3 => Mode::Normal,
            _ => {
                warn!("BME280 mode {raw} out of range, using forced");
                Mode::Forced
            }
        }
    }
}

/// Inactive time between conversions in normal mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Standby {
    Ms0_5 = 0,
    Ms62_5 = 1,
    Ms125 = 2,
    Ms250 = 3,
    Ms500 = 4,
    #[default]
    Ms1000 = 5,
    Ms10 = 6,
    Ms20 = 7,
}

impl Standby {
    pub fn from_raw(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_else(|| {
            warn!("BME280 standby {raw} out of range, using 20 ms");
            Standby::Ms20
        })
    }
}

/// IIR filter coefficient.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Filter {
    #[default]
    Off = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
    X16 = 4,
}

impl Filter {
    pub fn from_raw(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_else(|| {
            warn!("BME280 filter {raw} out of range, using x16");
            Filter::X16
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bme280Settings {
    pub temperature_oversampling: Oversampling,
    pub pressure_oversampling: Oversampling,
    pub humidity_oversampling: Oversampling,
    pub mode: Mode,
    pub standby: Standby,
    pub filter: Filter,
    /// Added to the compensated temperature to correct for self-heating.
    pub temperature_offset: f64,
}

impl Default for Bme280Settings {
    fn default() -> Self {
        Self {
            temperature_oversampling: Oversampling::X1,
            pressure_oversampling: Oversampling::X1,
            humidity_oversampling: Oversampling::X1,
            mode: Mode::Normal,
            standby: Standby::Ms1000,
            filter: Filter::Off,
            temperature_offset: 0.0,
        }
    }
}

impl Bme280Settings {
    pub fn ctrl_hum(&self) -> u8 {
        self.humidity_oversampling as u8
    }

    pub fn ctrl_meas(&self) -> u8 {
        ((self.temperature_oversampling as u8) << 5)
            | ((self.pressure_oversampling as u8) << 2)
            | self.mode as u8
    }

    pub fn config(&self) -> u8 {
        ((self.standby as u8) << 5) | ((self.filter as u8) << 2)
    }

    /// Maximum conversion time in microseconds, per datasheet appendix B.
    pub fn measurement_time_us(&self) -> u32 {
        let mut us = 1250 + 2300 * self.temperature_oversampling.factor();
        if self.pressure_oversampling.enabled() {
            us += 2300 * self.pressure_oversampling.factor() + 575;
        }
        if self.humidity_oversampling.enabled() {
            us += 2300 * self.humidity_oversampling.factor() + 575;
        }
        us
    }
}
