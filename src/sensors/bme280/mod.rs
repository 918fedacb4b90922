//! Bosch BME280 temperature, humidity and pressure sensor.
//!
//! Register map and timing from the BME280 datasheet (BST-BME280-DS001).
//! Calibration is read once on the first `configure()`/`update()`; after that
//! each cycle is a single 8-byte burst read, preceded by a trigger write when
//! the chip runs in forced mode. After any write to ctrl_meas the driver waits
//! for the conversion to finish before reading.

mod calibration;
mod settings;

pub use calibration::{Calibration, FineTemperature};
pub use settings::{Bme280Settings, Filter, Mode, Oversampling, Standby};

use super::state::{TriggerMachine, TriggerState};
use super::throttle::Throttle;
use super::{Channels, Measurement, Quantity, Sensor, SensorModel, UpdateStatus};
use crate::bus::{SharedBus, SmBus};
use crate::error::SensorError;
use calibration::{BLOCK_H_LEN, BLOCK_TP_LEN};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

pub const DEFAULT_ADDRESS: u8 = 0x76;
pub const ALTERNATE_ADDRESS: u8 = 0x77;
pub const CHIP_ID: u8 = 0x60;
pub const MIN_INTERVAL: Duration = Duration::from_secs(3);

const REG_CALIB_TP: u8 = 0x88;
const REG_CHIP_ID: u8 = 0xD0;
const REG_CALIB_H: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;

const STATUS_MEASURING: u8 = 0x08;
const STATUS_POLLS: usize = 5;
const STATUS_POLL_MS: u32 = 5;

/// Raw value the chip reports for a channel with oversampling skipped.
const SKIPPED_20BIT: u32 = 0x80000;
const SKIPPED_16BIT: u16 = 0x8000;

const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 85.0);
const PRESSURE_RANGE_HPA: (f64, f64) = (300.0, 1100.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detection {
    Pending,
    Detected,
    Missing,
}

#[derive(Debug, Clone, Copy)]
struct RawSample {
    pressure: u32,
    temperature: u32,
    humidity: u16,
}

impl RawSample {
    fn from_burst(data: &[u8; 8]) -> Self {
        let word20 = |i: usize| {
            ((data[i] as u32) << 12) | ((data[i + 1] as u32) << 4) | ((data[i + 2] as u32) >> 4)
        };
        Self {
            pressure: word20(0),
            temperature: word20(3),
            humidity: u16::from_be_bytes([data[6], data[7]]),
        }
    }
}

pub struct Bme280<B, D> {
    bus: SharedBus<B>,
    delay: D,
    address: u8,
    settings: Bme280Settings,
    calibration: Option<Calibration>,
    detection: Detection,
    machine: TriggerMachine,
    throttle: Throttle,
    channels: Channels,
    sample_ok: bool,
    needs_config: bool,
    /// A ctrl_meas write started a conversion whose result is not in yet.
    conversion_pending: bool,
}

impl<B, D> Bme280<B, D>
where
    B: SmBus + Send,
    D: DelayNs + Send,
{
    /// Create the driver. No bus traffic happens until the first
    /// `configure()` or `update()`.
    pub fn new(bus: SharedBus<B>, delay: D, address: u8, settings: Bme280Settings) -> Self {
        let channels = Channels::new(&quantities(&settings));
        Self {
            bus,
            delay,
            address,
            settings,
            calibration: None,
            detection: Detection::Pending,
            machine: TriggerMachine::new(TriggerState::PoweredDown),
            throttle: Throttle::new(MIN_INTERVAL),
            channels,
            sample_ok: false,
            needs_config: true,
            conversion_pending: false,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.throttle.set_min_interval(min_interval);
        self
    }

    pub fn settings(&self) -> &Bme280Settings {
        &self.settings
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn state(&self) -> TriggerState {
        self.machine.state()
    }

    /// Replace the settings and write them to the chip.
    pub fn reconfigure(&mut self, settings: Bme280Settings) -> Result<(), SensorError> {
        self.channels.retain_only(&quantities(&settings));
        self.settings = settings;
        self.needs_config = true;
        self.throttle.reset();
        self.configure()
    }

    /// Verify the chip id and load calibration. Runs at most once.
    fn ensure_detected(&mut self, bus: &mut B) -> Result<(), SensorError> {
        match self.detection {
            Detection::Detected => return Ok(()),
            Detection::Missing => return Err(SensorError::NotDetected),
            Detection::Pending => {}
        }

        match self.load_calibration(bus) {
            Ok(calibration) => {
                info!(
                    "BME280 detected at 0x{:02x}: {}xT {}xP {}xH, mode {}, standby {}, filter {}",
                    self.address,
                    self.settings.temperature_oversampling.factor(),
                    self.settings.pressure_oversampling.factor(),
                    self.settings.humidity_oversampling.factor(),
                    self.settings.mode,
                    self.settings.standby,
                    self.settings.filter,
                );
                self.calibration = Some(calibration);
                self.detection = Detection::Detected;
                Ok(())
            }
            Err(e) => {
                error!("BME280 not detected at 0x{:02x}: {}", self.address, e);
                self.detection = Detection::Missing;
                self.sample_ok = false;
                self.channels.reject_all();
                Err(e)
            }
        }
    }

    fn load_calibration(&mut self, bus: &mut B) -> Result<Calibration, SensorError> {
        let id = bus.read_byte_data(self.address, REG_CHIP_ID)?;
        if id != CHIP_ID {
            return Err(SensorError::UnexpectedChipId {
                expected: CHIP_ID,
                found: id,
            });
        }

        let mut tp = [0u8; BLOCK_TP_LEN];
        bus.read_block(self.address, REG_CALIB_TP, &mut tp)?;
        let mut h = [0u8; BLOCK_H_LEN];
        bus.read_block(self.address, REG_CALIB_H, &mut h)?;
        Ok(Calibration::parse(&tp, &h))
    }

    /// ctrl_hum only takes effect after the following ctrl_meas write.
    fn write_config(&mut self, bus: &mut B) -> Result<(), SensorError> {
        bus.write_byte_data(self.address, REG_CTRL_HUM, self.settings.ctrl_hum())?;
        bus.write_byte_data(self.address, REG_CONFIG, self.settings.config())?;
        bus.write_byte_data(self.address, REG_CTRL_MEAS, self.settings.ctrl_meas())?;
        self.machine.advance(TriggerState::PoweredOn)?;
        self.machine.advance(TriggerState::ModeSet)?;
        self.needs_config = false;
        self.conversion_pending = true;
        Ok(())
    }

    fn wait_for_conversion(&mut self, bus: &mut B) -> Result<(), SensorError> {
        self.delay.delay_us(self.settings.measurement_time_us());
        for _ in 0..STATUS_POLLS {
            if bus.read_byte_data(self.address, REG_STATUS)? & STATUS_MEASURING == 0 {
                self.conversion_pending = false;
                return Ok(());
            }
            self.delay.delay_ms(STATUS_POLL_MS);
        }
        Err(SensorError::ConversionTimeout)
    }

    fn read_raw(&mut self, bus: &mut B) -> Result<RawSample, SensorError> {
        match self.settings.mode {
            Mode::Forced => {
                if self.needs_config {
                    self.write_config(bus)?;
                } else {
                    bus.write_byte_data(self.address, REG_CTRL_MEAS, self.settings.ctrl_meas())?;
                }
                self.machine.advance(TriggerState::Measuring)?;
                self.wait_for_conversion(bus)?;
            }
            Mode::Normal | Mode::Sleep => {
                if self.needs_config {
                    self.write_config(bus)?;
                }
                if self.machine.state() != TriggerState::Measuring {
                    self.machine.advance(TriggerState::Measuring)?;
                }
                // Until the first conversion after a mode write completes the
                // data registers still hold their reset values.
                if self.conversion_pending {
                    self.wait_for_conversion(bus)?;
                }
            }
        }

        let mut data = [0u8; 8];
        bus.read_block(self.address, REG_DATA, &mut data)?;
        self.machine.advance(TriggerState::Ready)?;
        if self.settings.mode == Mode::Normal {
            // Free-running: the next burst is already being converted.
            self.machine.advance(TriggerState::Measuring)?;
        }
        Ok(RawSample::from_burst(&data))
    }

    fn commit(&mut self, raw: RawSample, calibration: Calibration) {
        let (temperature, fine) =
            calibration.compensate_temperature(raw.temperature, self.settings.temperature_offset);

        if raw.temperature == SKIPPED_20BIT
            || temperature < TEMPERATURE_RANGE.0
            || temperature > TEMPERATURE_RANGE.1
        {
            warn!(
                "BME280 at 0x{:02x}: {}",
                self.address,
                SensorError::OutOfRange {
                    quantity: Quantity::Temperature,
                    value: temperature,
                }
            );
            self.channels.reject_all();
            return;
        }
        self.channels.accept(Quantity::Temperature, temperature);

        if self.settings.humidity_oversampling.enabled() {
            if raw.humidity == SKIPPED_16BIT {
                self.channels.reject(Quantity::Humidity);
            } else {
                let humidity = calibration.compensate_humidity(raw.humidity, fine);
                self.channels.accept(Quantity::Humidity, humidity);
            }
        }

        if self.settings.pressure_oversampling.enabled() {
            let pressure = if raw.pressure == SKIPPED_20BIT {
                None
            } else {
                calibration
                    .compensate_pressure(raw.pressure, fine)
                    .map(|pa| pa / 100.0)
            };
            match pressure {
                Some(hpa) if (PRESSURE_RANGE_HPA.0..=PRESSURE_RANGE_HPA.1).contains(&hpa) => {
                    self.channels.accept(Quantity::Pressure, hpa)
                }
                other => {
                    warn!(
                        "BME280 at 0x{:02x}: implausible pressure {:?}",
                        self.address, other
                    );
                    self.channels.reject(Quantity::Pressure);
                }
            }
        }
    }
}

fn quantities(settings: &Bme280Settings) -> Vec<Quantity> {
    let mut q = vec![Quantity::Temperature];
    if settings.humidity_oversampling.enabled() {
        q.push(Quantity::Humidity);
    }
    if settings.pressure_oversampling.enabled() {
        q.push(Quantity::Pressure);
    }
    q
}

impl<B, D> Sensor for Bme280<B, D>
where
    B: SmBus + Send,
    D: DelayNs + Send,
{
    fn model(&self) -> SensorModel {
        SensorModel::Bme280
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        if self.detection == Detection::Missing {
            return Err(SensorError::NotDetected);
        }
        let bus = self.bus.clone();
        let mut bus = bus.lock();
        self.ensure_detected(&mut bus)?;
        self.write_config(&mut bus).inspect_err(|_| {
            self.machine.fault();
            self.needs_config = true;
        })
    }

    fn update_at(&mut self, now: Instant) -> UpdateStatus {
        if self.detection == Detection::Missing {
            return UpdateStatus::Undetected;
        }
        if !self.throttle.try_acquire(now) {
            return UpdateStatus::Throttled;
        }

        let bus = self.bus.clone();
        let mut bus = bus.lock();
        if self.ensure_detected(&mut bus).is_err() {
            return UpdateStatus::Undetected;
        }
        let Some(calibration) = self.calibration else {
            return UpdateStatus::Undetected;
        };

        match self.read_raw(&mut bus) {
            Ok(raw) => {
                debug!(
                    "BME280 at 0x{:02x}: raw T={} P={} H={}",
                    self.address, raw.temperature, raw.pressure, raw.humidity
                );
                self.sample_ok = true;
                self.commit(raw, calibration);
                UpdateStatus::Sampled
            }
            Err(e) => {
                warn!("Bad update of BME280 at 0x{:02x}: {}", self.address, e);
                self.machine.fault();
                self.needs_config = true;
                self.sample_ok = false;
                self.channels.reject_all();
                UpdateStatus::Failed
            }
        }
    }

    fn sample_ok(&self) -> bool {
        self.sample_ok
    }

    fn detected(&self) -> bool {
        self.detection == Detection::Detected
    }

    fn measurements(&self) -> Vec<Measurement> {
        self.channels.to_vec()
    }
}
