//! TE HTU21D temperature and humidity sensor.
//!
//! Measurements use the "no hold master" commands: trigger, wait the
//! conversion time for the configured resolution, then read three bytes
//! (MSB, LSB, CRC). Each channel carries its own CRC, so a corrupted frame
//! only invalidates that channel.

use super::state::{TriggerMachine, TriggerState};
use super::throttle::Throttle;
use super::{Channels, Measurement, Quantity, Sensor, SensorModel, UpdateStatus, wait};
use crate::bus::{SharedBus, SmBus};
use crate::error::SensorError;
use crc::{Algorithm, Crc};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strum::Display;

pub const ADDRESS: u8 = 0x40;
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

const TRIGGER_TEMPERATURE: u8 = 0xF3;
const TRIGGER_HUMIDITY: u8 = 0xF5;
const WRITE_USER_REGISTER: u8 = 0xE6;
const READ_USER_REGISTER: u8 = 0xE7;
const SOFT_RESET: u8 = 0xFE;
const SOFT_RESET_MS: u32 = 15;

const RESOLUTION_MASK: u8 = 0x81;
const STATUS_MASK: u16 = 0xFFFC;

const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 125.0);

// Magnus coefficients from the HTU21D datasheet.
const MAGNUS_A: f64 = 8.1332;
const MAGNUS_B: f64 = 1762.39;
const MAGNUS_C: f64 = 235.66;

/// Measurement resolution, user register bits 7 and 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Htu21dResolution {
    #[default]
    Rh12T14,
    Rh8T12,
    Rh10T13,
    Rh11T11,
}

impl Htu21dResolution {
    pub fn bits(self) -> u8 {
        match self {
            Htu21dResolution::Rh12T14 => 0x00,
            Htu21dResolution::Rh8T12 => 0x01,
            Htu21dResolution::Rh10T13 => 0x80,
            Htu21dResolution::Rh11T11 => 0x81,
        }
    }

    /// Maximum temperature conversion time.
    pub fn temperature_time(self) -> Duration {
        Duration::from_millis(match self {
            Htu21dResolution::Rh12T14 => 50,
            Htu21dResolution::Rh10T13 => 25,
            Htu21dResolution::Rh8T12 => 13,
            Htu21dResolution::Rh11T11 => 7,
        })
    }

    /// Maximum humidity conversion time.
    pub fn humidity_time(self) -> Duration {
        Duration::from_millis(match self {
            Htu21dResolution::Rh12T14 => 16,
            Htu21dResolution::Rh11T11 => 8,
            Htu21dResolution::Rh10T13 => 5,
            Htu21dResolution::Rh8T12 => 3,
        })
    }

    /// Replace the resolution bits of a user register value, keeping the rest.
    pub fn apply_to(self, user_register: u8) -> u8 {
        (user_register & !RESOLUTION_MASK) | self.bits()
    }
}

/// CRC-8 with polynomial x^8 + x^5 + x^4 + 1, initial value 0.
pub const HTU21D_CRC: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xA2,
    residue: 0x00,
};

const CRC: Crc<u8> = Crc::<u8>::new(&HTU21D_CRC);

pub fn crc8(data: &[u8]) -> u8 {
    CRC.checksum(data)
}

pub fn temperature_from_raw(raw: u16) -> f64 {
    -46.85 + 175.72 * (raw & STATUS_MASK) as f64 / 65536.0
}

pub fn humidity_from_raw(raw: u16) -> f64 {
    -6.0 + 125.0 * (raw & STATUS_MASK) as f64 / 65536.0
}

/// Apply the temperature coefficient and clamp to [0, 100].
pub fn compensate_humidity(humidity: f64, temperature: Option<f64>) -> f64 {
    let rh = match temperature {
        Some(t) => humidity + (25.0 - t) * -0.15,
        None => humidity,
    };
    rh.clamp(0.0, 100.0)
}

pub fn dew_point(temperature: f64, humidity: f64) -> Option<f64> {
    if humidity <= 0.0 {
        return None;
    }
    let partial_pressure = 10f64.powf(MAGNUS_A - MAGNUS_B / (temperature + MAGNUS_C));
    Some(-(MAGNUS_C + MAGNUS_B / ((humidity * partial_pressure / 100.0).log10() - MAGNUS_A)))
}

fn check_frame(frame: [u8; 3], quantity: Quantity) -> Result<u16, SensorError> {
    if crc8(&frame[..2]) != frame[2] {
        return Err(SensorError::Integrity { quantity });
    }
    Ok(u16::from_be_bytes([frame[0], frame[1]]))
}

pub struct Htu21d<B, D> {
    bus: SharedBus<B>,
    delay: D,
    resolution: Htu21dResolution,
    detected: Option<bool>,
    needs_config: bool,
    machine: TriggerMachine,
    throttle: Throttle,
    channels: Channels,
    sample_ok: bool,
}

impl<B, D> Htu21d<B, D>
where
    B: SmBus + Send,
    D: DelayNs + Send,
{
    pub fn new(bus: SharedBus<B>, delay: D, resolution: Htu21dResolution) -> Self {
        Self {
            bus,
            delay,
            resolution,
            detected: None,
            needs_config: true,
            machine: TriggerMachine::new(TriggerState::PoweredOn),
            throttle: Throttle::new(MIN_INTERVAL),
            channels: Channels::new(&[
                Quantity::Temperature,
                Quantity::Humidity,
                Quantity::DewPoint,
            ]),
            sample_ok: false,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.throttle.set_min_interval(min_interval);
        self
    }

    pub fn resolution(&self) -> Htu21dResolution {
        self.resolution
    }

    pub fn state(&self) -> TriggerState {
        self.machine.state()
    }

    pub fn reconfigure(&mut self, resolution: Htu21dResolution) -> Result<(), SensorError> {
        self.resolution = resolution;
        self.needs_config = true;
        self.configure()
    }

    fn ensure_detected(&mut self, bus: &mut B) -> Result<(), SensorError> {
        match self.detected {
            Some(true) => return Ok(()),
            Some(false) => return Err(SensorError::NotDetected),
            None => {}
        }

        let reset = bus
            .write_byte(ADDRESS, SOFT_RESET)
            .map_err(SensorError::from)
            .and_then(|()| self.machine.advance(TriggerState::Reset));
        match reset {
            Ok(()) => {
                self.delay.delay_ms(SOFT_RESET_MS);
                info!(
                    "HTU21D detected at 0x{:02x}, resolution {}",
                    ADDRESS, self.resolution
                );
                self.detected = Some(true);
                Ok(())
            }
            Err(e) => {
                error!("HTU21D not detected at 0x{:02x}: {}", ADDRESS, e);
                self.machine.fault();
                self.detected = Some(false);
                self.sample_ok = false;
                self.channels.reject_all();
                Err(e)
            }
        }
    }

    fn write_resolution(&mut self, bus: &mut B) -> Result<(), SensorError> {
        let current = bus.read_byte_data(ADDRESS, READ_USER_REGISTER)?;
        bus.write_byte_data(ADDRESS, WRITE_USER_REGISTER, self.resolution.apply_to(current))?;
        if self.machine.state() == TriggerState::Unknown {
            self.machine.advance(TriggerState::PoweredOn)?;
        }
        self.machine.advance(TriggerState::ModeSet)?;
        self.needs_config = false;
        Ok(())
    }

    fn read_channel(
        &mut self,
        bus: &mut B,
        command: u8,
        time: Duration,
    ) -> Result<[u8; 3], SensorError> {
        bus.write_byte(ADDRESS, command)?;
        self.machine.advance(TriggerState::Measuring)?;
        wait(&mut self.delay, time);
        let mut frame = [0u8; 3];
        bus.read(ADDRESS, &mut frame)?;
        self.machine.advance(TriggerState::Ready)?;
        Ok(frame)
    }

    fn read_frames(&mut self, bus: &mut B) -> Result<([u8; 3], [u8; 3]), SensorError> {
        if self.needs_config {
            self.write_resolution(bus)?;
        }
        let temperature =
            self.read_channel(bus, TRIGGER_TEMPERATURE, self.resolution.temperature_time())?;
        let humidity =
            self.read_channel(bus, TRIGGER_HUMIDITY, self.resolution.humidity_time())?;
        Ok((temperature, humidity))
    }

    fn commit(&mut self, t_frame: [u8; 3], rh_frame: [u8; 3]) {
        let temperature = match check_frame(t_frame, Quantity::Temperature) {
            Ok(raw) => {
                let t = temperature_from_raw(raw);
                if (TEMPERATURE_RANGE.0..=TEMPERATURE_RANGE.1).contains(&t) {
                    Ok(t)
                } else {
                    Err(SensorError::OutOfRange {
                        quantity: Quantity::Temperature,
                        value: t,
                    })
                }
            }
            Err(e) => Err(e),
        };
        let humidity = check_frame(rh_frame, Quantity::Humidity)
            .map(|raw| compensate_humidity(humidity_from_raw(raw), temperature.clone().ok()));

        match temperature {
            Ok(t) => self.channels.accept(Quantity::Temperature, t),
            Err(ref e) => {
                warn!("HTU21D: {e}");
                self.channels.reject(Quantity::Temperature);
            }
        }
        match humidity {
            Ok(rh) => self.channels.accept(Quantity::Humidity, rh),
            Err(ref e) => {
                warn!("HTU21D: {e}");
                self.channels.reject(Quantity::Humidity);
            }
        }

        match (temperature, humidity) {
            (Ok(t), Ok(rh)) => match dew_point(t, rh) {
                Some(td) => self.channels.accept(Quantity::DewPoint, td),
                None => self.channels.reject(Quantity::DewPoint),
            },
            _ => self.channels.reject(Quantity::DewPoint),
        }
    }
}

impl<B, D> Sensor for Htu21d<B, D>
where
    B: SmBus + Send,
    D: DelayNs + Send,
{
    fn model(&self) -> SensorModel {
        SensorModel::Htu21d
    }

    fn address(&self) -> u8 {
        ADDRESS
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        let bus = self.bus.clone();
        let mut bus = bus.lock();
        self.ensure_detected(&mut bus)?;
        self.write_resolution(&mut bus).inspect_err(|_| {
            self.machine.fault();
            self.needs_config = true;
        })
    }

    fn update_at(&mut self, now: Instant) -> UpdateStatus {
        if self.detected == Some(false) {
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

        match self.read_frames(&mut bus) {
            Ok((t_frame, rh_frame)) => {
                debug!("HTU21D frames: T={t_frame:02x?} RH={rh_frame:02x?}");
                self.sample_ok = true;
                self.commit(t_frame, rh_frame);
                UpdateStatus::Sampled
            }
            Err(e) => {
                warn!("Bad update of HTU21D at 0x{:02x}: {}", ADDRESS, e);
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
        self.detected == Some(true)
    }

    fn measurements(&self) -> Vec<Measurement> {
        self.channels.to_vec()
    }
}
