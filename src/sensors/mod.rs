//! I2C environmental sensor drivers.
//!
//! Every chip driver implements the [`Sensor`] trait so the poller can treat
//! them uniformly. A driver owns its register configuration, calibration
//! data and the measurement trigger sequence; the bus is shared and only
//! locked for the duration of one update.
//!
//! Failures never escape [`Sensor::update`]: they are downgraded to an
//! [`UpdateStatus`] and the `sample_ok` flag, and the last known values stay
//! readable with `valid == false`.

pub mod average;
pub mod bh1750;
pub mod bme280;
pub mod htu21d;
pub mod state;
pub mod throttle;

pub use average::RollingAverage;
pub use bh1750::{Bh1750, Bh1750Mode, Bh1750Settings};
pub use bme280::{Bme280, Bme280Settings};
pub use htu21d::{Htu21d, Htu21dResolution};
pub use state::TriggerState;
pub use throttle::Throttle;

use embedded_hal::delay::DelayNs;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strum::Display;

/// Physical quantity reported by a sensor channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Quantity {
    Temperature,
    Humidity,
    Pressure,
    Illuminance,
    DewPoint,
}

impl Quantity {
    /// Unit of the values the drivers produce.
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature | Quantity::DewPoint => "°C",
            Quantity::Humidity => "%",
            Quantity::Pressure => "hPa",
            Quantity::Illuminance => "lx",
        }
    }

    pub fn is_temperature(&self) -> bool {
        matches!(self, Quantity::Temperature | Quantity::DewPoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum SensorModel {
    Bme280,
    Bh1750,
    Htu21d,
}

/// Latest value of one channel.
///
/// `value` is `None` until the first good sample. After a failed cycle the
/// previous value is kept and `valid` drops to `false`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub quantity: Quantity,
    pub value: Option<f64>,
    pub valid: bool,
}

impl Measurement {
    pub fn unknown(quantity: Quantity) -> Self {
        Self {
            quantity,
            value: None,
            valid: false,
        }
    }

    /// The value, only if the last cycle produced it.
    pub fn valid_value(&self) -> Option<f64> {
        if self.valid { self.value } else { None }
    }
}

/// Outcome of one `update()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// The hardware was sampled without bus errors.
    Sampled,
    /// Called again within the minimum interval; cached values unchanged.
    Throttled,
    /// A bus transaction failed; cached values are stale.
    Failed,
    /// The chip never initialised; nothing was attempted.
    Undetected,
}

/// Capability set shared by all chip drivers.
pub trait Sensor: Send {
    fn model(&self) -> SensorModel;

    /// 7-bit bus address.
    fn address(&self) -> u8;

    /// Write the current settings to the chip, initialising it first if
    /// needed. Calling it again with unchanged settings writes the same bytes.
    fn configure(&mut self) -> Result<(), crate::error::SensorError>;

    /// Run one measurement cycle as of `now`.
    fn update_at(&mut self, now: Instant) -> UpdateStatus;

    fn update(&mut self) -> UpdateStatus {
        self.update_at(Instant::now())
    }

    /// Whether the most recent bus transactions succeeded.
    fn sample_ok(&self) -> bool;

    /// Whether initialisation (and calibration, where needed) succeeded.
    fn detected(&self) -> bool;

    fn measurements(&self) -> Vec<Measurement>;

    fn measurement(&self, quantity: Quantity) -> Option<Measurement> {
        self.measurements()
            .into_iter()
            .find(|m| m.quantity == quantity)
    }
}

/// Block for `duration`, in steps that fit the `DelayNs` argument.
pub(crate) fn wait<D: DelayNs>(delay: &mut D, duration: Duration) {
    let mut remaining = duration.as_micros();
    while remaining > 0 {
        let step = remaining.min(u32::MAX as u128) as u32;
        delay.delay_us(step);
        remaining -= step as u128;
    }
}

/// Per-driver storage of the latest measurements.
#[derive(Debug, Clone)]
pub(crate) struct Channels {
    items: Vec<Measurement>,
}

impl Channels {
    pub(crate) fn new(quantities: &[Quantity]) -> Self {
        Self {
            items: quantities.iter().map(|q| Measurement::unknown(*q)).collect(),
        }
    }

    /// Replace the channel list, keeping values of quantities still present.
    pub(crate) fn retain_only(&mut self, quantities: &[Quantity]) {
        let old = std::mem::take(&mut self.items);
        self.items = quantities
            .iter()
            .map(|q| {
                old.iter()
                    .find(|m| m.quantity == *q)
                    .copied()
                    .unwrap_or_else(|| Measurement::unknown(*q))
            })
            .collect();
    }

    pub(crate) fn accept(&mut self, quantity: Quantity, value: f64) {
        if let Some(m) = self.items.iter_mut().find(|m| m.quantity == quantity) {
            m.value = Some(value);
            m.valid = true;
        }
    }

    pub(crate) fn reject(&mut self, quantity: Quantity) {
        if let Some(m) = self.items.iter_mut().find(|m| m.quantity == quantity) {
            m.valid = false;
        }
    }

    pub(crate) fn reject_all(&mut self) {
        for m in &mut self.items {
            m.valid = false;
        }
    }

    pub(crate) fn get(&self, quantity: Quantity) -> Option<&Measurement> {
        self.items.iter().find(|m| m.quantity == quantity)
    }

    pub(crate) fn to_vec(&self) -> Vec<Measurement> {
        self.items.clone()
    }
}
