//! Rohm BH1750 ambient light sensor.
//!
//! The chip has no registers, only opcodes. A measurement is started by
//! writing a mode opcode; the result is read back as a big-endian word.

use super::state::{TriggerMachine, TriggerState};
use super::throttle::Throttle;
use super::{Channels, Measurement, Quantity, Sensor, SensorModel, UpdateStatus, wait};
use crate::bus::{SharedBus, SmBus};
use crate::error::SensorError;
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strum::{Display, FromRepr};

pub const DEFAULT_ADDRESS: u8 = 0x23;
pub const ALTERNATE_ADDRESS: u8 = 0x5C;
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

const POWER_DOWN: u8 = 0x00;
const POWER_ON: u8 = 0x01;
const RESET: u8 = 0x07;
const MTREG_HIGH: u8 = 0x40;
const MTREG_LOW: u8 = 0x60;

/// Default measurement time register value.
pub const DEFAULT_SENSITIVITY: u8 = 69;
pub const MIN_SENSITIVITY: u8 = 31;
pub const MAX_SENSITIVITY: u8 = 254;
pub const DEFAULT_MEASUREMENT_DELAY: Duration = Duration::from_millis(120);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Bh1750Mode {
    #[default]
    #[serde(rename = "continuous_high_res_mode_1")]
    #[strum(serialize = "continuous_high_res_mode_1")]
    ContinuousHighRes = 0x10,
    #[serde(rename = "continuous_high_res_mode_2")]
    #[strum(serialize = "continuous_high_res_mode_2")]
    ContinuousHighRes2 = 0x11,
    #[serde(rename = "continuous_low_res_mode")]
    #[strum(serialize = "continuous_low_res_mode")]
    ContinuousLowRes = 0x13,
    #[serde(rename = "one_time_high_res_mode_1")]
    #[strum(serialize = "one_time_high_res_mode_1")]
    OneTimeHighRes = 0x20,
    #[serde(rename = "one_time_high_res_mode_2")]
    #[strum(serialize = "one_time_high_res_mode_2")]
    OneTimeHighRes2 = 0x21,
    #[serde(rename = "one_time_low_res_mode")]
    #[strum(serialize = "one_time_low_res_mode")]
    OneTimeLowRes = 0x23,
}

impl Bh1750Mode {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn is_continuous(self) -> bool {
        self.opcode() & 0x10 != 0
    }

    pub fn is_low_res(self) -> bool {
        self.opcode() & 0x03 == 0x03
    }

    /// High resolution mode 2 reports half-lux counts.
    pub fn divisor(self) -> f64 {
        if self.opcode() & 0x03 == 0x01 { 2.0 } else { 1.0 }
    }

    fn base_time_ms(self) -> u32 {
        if self.is_low_res() { 18 } else { 128 }
    }
}

/// Clamp a configured measurement time register value to what the chip
/// accepts.
pub fn clamp_sensitivity(raw: u32) -> u8 {
    let clamped = raw.clamp(MIN_SENSITIVITY as u32, MAX_SENSITIVITY as u32) as u8;
    if clamped as u32 != raw {
        warn!("BH1750 sensitivity {raw} out of range, using {clamped}");
    }
    clamped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bh1750Settings {
    pub mode: Bh1750Mode,
    sensitivity: u8,
    pub measurement_delay: Duration,
}

impl Default for Bh1750Settings {
    fn default() -> Self {
        Self {
            mode: Bh1750Mode::default(),
            sensitivity: DEFAULT_SENSITIVITY,
            measurement_delay: DEFAULT_MEASUREMENT_DELAY,
        }
    }
}

impl Bh1750Settings {
    pub fn new(mode: Bh1750Mode, sensitivity: u32, measurement_delay: Duration) -> Self {
        Self {
            mode,
            sensitivity: clamp_sensitivity(sensitivity),
            measurement_delay,
        }
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity
    }

    /// Time to wait after triggering a conversion.
    pub fn measurement_time(&self) -> Duration {
        let base_us = self.mode.base_time_ms() * 1000;
        let scaled = base_us * self.sensitivity as u32 / DEFAULT_SENSITIVITY as u32;
        Duration::from_micros(scaled as u64) + self.measurement_delay
    }

    /// Convert a raw count to lux.
    pub fn lux(&self, count: u16) -> f64 {
        let scale = self.sensitivity as f64 / DEFAULT_SENSITIVITY as f64;
        count as f64 / (1.2 * scale * self.mode.divisor())
    }
}

pub struct Bh1750<B, D> {
    bus: SharedBus<B>,
    delay: D,
    address: u8,
    settings: Bh1750Settings,
    current_mode: Option<Bh1750Mode>,
    detected: Option<bool>,
    machine: TriggerMachine,
    throttle: Throttle,
    channels: Channels,
    sample_ok: bool,
}

impl<B, D> Bh1750<B, D>
where
    B: SmBus + Send,
    D: DelayNs + Send,
{
    pub fn new(bus: SharedBus<B>, delay: D, address: u8, settings: Bh1750Settings) -> Self {
        Self {
            bus,
            delay,
            address,
            settings,
            current_mode: None,
            detected: None,
            machine: TriggerMachine::new(TriggerState::PoweredDown),
            throttle: Throttle::new(MIN_INTERVAL),
            channels: Channels::new(&[Quantity::Illuminance]),
            sample_ok: false,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.throttle.set_min_interval(min_interval);
        self
    }

    pub fn settings(&self) -> &Bh1750Settings {
        &self.settings
    }

    pub fn state(&self) -> TriggerState {
        self.machine.state()
    }

    /// Change the measurement time register. The next update re-triggers.
    pub fn set_sensitivity(&mut self, sensitivity: u32) -> Result<(), SensorError> {
        self.settings.sensitivity = clamp_sensitivity(sensitivity);
        self.configure()
    }

    pub fn reconfigure(&mut self, settings: Bh1750Settings) -> Result<(), SensorError> {
        self.settings = settings;
        self.configure()
    }

    fn command(&mut self, bus: &mut B, opcode: u8, next: TriggerState) -> Result<(), SensorError> {
        bus.write_byte(self.address, opcode)?;
        self.machine.advance(next)
    }

    fn power_down(&mut self, bus: &mut B) -> Result<(), SensorError> {
        self.command(bus, POWER_DOWN, TriggerState::PoweredDown)
    }

    fn power_on(&mut self, bus: &mut B) -> Result<(), SensorError> {
        self.command(bus, POWER_ON, TriggerState::PoweredOn)
    }

    /// Power down, then write the measurement time register.
    fn apply(&mut self, bus: &mut B) -> Result<(), SensorError> {
        let mt = self.settings.sensitivity;
        self.power_down(bus)?;
        self.power_on(bus)?;
        bus.write_byte(self.address, MTREG_HIGH | (mt >> 5))?;
        bus.write_byte(self.address, MTREG_LOW | (mt & 0x1F))?;
        self.power_down(bus)?;
        self.current_mode = None;
        Ok(())
    }

    fn ensure_detected(&mut self, bus: &mut B) -> Result<(), SensorError> {
        match self.detected {
            Some(true) => Ok(()),
            Some(false) => Err(SensorError::NotDetected),
            None => match self.apply(bus) {
                Ok(()) => {
                    info!(
                        "BH1750 detected at 0x{:02x} in mode {} (sensitivity {})",
                        self.address, self.settings.mode, self.settings.sensitivity
                    );
                    self.detected = Some(true);
                    Ok(())
                }
                Err(e) => {
                    error!("BH1750 not detected at 0x{:02x}: {}", self.address, e);
                    self.machine.fault();
                    self.detected = Some(false);
                    self.sample_ok = false;
                    self.channels.reject_all();
                    Err(e)
                }
            },
        }
    }

    fn measure(&mut self, bus: &mut B) -> Result<u16, SensorError> {
        let mode = self.settings.mode;
        if !mode.is_continuous() || self.current_mode != Some(mode) {
            self.power_on(bus)?;
            self.command(bus, RESET, TriggerState::Reset)?;
            self.command(bus, mode.opcode(), TriggerState::ModeSet)?;
            self.current_mode = Some(mode);
            self.machine.advance(TriggerState::Measuring)?;
            wait(&mut self.delay, self.settings.measurement_time());
        } else if self.machine.state() != TriggerState::Measuring {
            self.machine.advance(TriggerState::Measuring)?;
        }

        let word = bus.read_word_data(self.address, mode.opcode())?;
        self.machine.advance(TriggerState::Ready)?;
        if mode.is_continuous() {
            self.machine.advance(TriggerState::Measuring)?;
        } else {
            self.power_down(bus)?;
        }
        // The chip sends the high byte first.
        Ok(word.swap_bytes())
    }
}

impl<B, D> Sensor for Bh1750<B, D>
where
    B: SmBus + Send,
    D: DelayNs + Send,
{
    fn model(&self) -> SensorModel {
        SensorModel::Bh1750
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        let bus = self.bus.clone();
        let mut bus = bus.lock();
        match self.detected {
            Some(false) => Err(SensorError::NotDetected),
            None => self.ensure_detected(&mut bus),
            Some(true) => self.apply(&mut bus).inspect_err(|_| {
                self.machine.fault();
                self.current_mode = None;
            }),
        }
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

        match self.measure(&mut bus) {
            Ok(count) => {
                let lux = self.settings.lux(count);
                debug!(
                    "BH1750 at 0x{:02x}: count {} -> {:.1} lx",
                    self.address, count, lux
                );
                self.sample_ok = true;
                self.channels.accept(Quantity::Illuminance, lux);
                UpdateStatus::Sampled
            }
            Err(e) => {
                warn!("Bad update of BH1750 at 0x{:02x}: {}", self.address, e);
                self.machine.fault();
                self.current_mode = None;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, RecordingDelay, Transaction};

    const ADDR: u8 = DEFAULT_ADDRESS;

    fn sensor(
        settings: Bh1750Settings,
    ) -> (Bh1750<MockBus, RecordingDelay>, SharedBus<MockBus>, RecordingDelay) {
        let mut mock = MockBus::new();
        // 1000 counts, MSB first
        mock.set_block(ADDR, settings.mode.opcode(), &[0x03, 0xE8]);
        let bus = SharedBus::new(mock);
        let delay = RecordingDelay::new();
        let dev = Bh1750::new(bus.clone(), delay.clone(), ADDR, settings);
        (dev, bus, delay)
    }

    fn lux(dev: &Bh1750<MockBus, RecordingDelay>) -> f64 {
        dev.measurement(Quantity::Illuminance)
            .unwrap()
            .valid_value()
            .unwrap()
    }

    #[test]
    fn test_sensitivity_is_clamped() {
        assert_eq!(clamp_sensitivity(0), 31);
        assert_eq!(clamp_sensitivity(999), 254);
        assert_eq!(clamp_sensitivity(69), 69);
        let s = Bh1750Settings::new(Bh1750Mode::OneTimeLowRes, 5, Duration::ZERO);
        assert_eq!(s.sensitivity(), 31);
    }

    #[test]
    fn test_lux_conversion() {
        let mode1 = Bh1750Settings::default();
        assert!((mode1.lux(1000) - 833.333).abs() < 1e-3);

        let mode2 = Bh1750Settings::new(
            Bh1750Mode::ContinuousHighRes2,
            69,
            DEFAULT_MEASUREMENT_DELAY,
        );
        assert!((mode2.lux(1000) - 416.667).abs() < 1e-3);

        let double_mt =
            Bh1750Settings::new(Bh1750Mode::ContinuousHighRes, 138, DEFAULT_MEASUREMENT_DELAY);
        assert!((double_mt.lux(1000) - 416.667).abs() < 1e-3);

        let min_mt =
            Bh1750Settings::new(Bh1750Mode::ContinuousHighRes, 0, DEFAULT_MEASUREMENT_DELAY);
        assert!((min_mt.lux(1000) - 1854.839).abs() < 1e-3);
    }

    #[test]
    fn test_measurement_time() {
        assert_eq!(
            Bh1750Settings::default().measurement_time(),
            Duration::from_millis(248)
        );
        let low = Bh1750Settings::new(Bh1750Mode::OneTimeLowRes, 138, Duration::ZERO);
        assert_eq!(low.measurement_time(), Duration::from_millis(36));
    }

    #[test]
    fn test_long_measurement_delay_is_not_truncated() {
        let settings = Bh1750Settings::new(
            Bh1750Mode::OneTimeLowRes,
            69,
            Duration::from_secs(2 * 60 * 60),
        );
        let (mut dev, _, delay) = sensor(settings);
        assert_eq!(dev.update_at(Instant::now()), UpdateStatus::Sampled);
        assert_eq!(delay.total_ms(), 2 * 60 * 60 * 1000 + 18);
    }

    #[test]
    fn test_mode_names_match_config_values() {
        let mode: Bh1750Mode = serde_json::from_str("\"one_time_high_res_mode_2\"").unwrap();
        assert_eq!(mode, Bh1750Mode::OneTimeHighRes2);
        assert_eq!(
            Bh1750Mode::ContinuousLowRes.to_string(),
            "continuous_low_res_mode"
        );
        assert!(Bh1750Mode::ContinuousLowRes.is_low_res());
        assert!(!Bh1750Mode::OneTimeHighRes.is_continuous());
    }

    #[test]
    fn test_configure_writes_sensitivity_sequence() {
        let (mut dev, bus, _) = sensor(Bh1750Settings::default());
        assert!(bus.lock().transactions().is_empty());

        dev.configure().unwrap();
        let expected = vec![POWER_DOWN, POWER_ON, 0x42, 0x65, POWER_DOWN];
        assert_eq!(bus.lock().commands(ADDR), expected);

        bus.lock().clear_transactions();
        dev.configure().unwrap();
        assert_eq!(bus.lock().commands(ADDR), expected);
        assert_eq!(dev.state(), TriggerState::PoweredDown);
    }

    #[test]
    fn test_continuous_mode_triggers_once() {
        let (mut dev, bus, delay) = sensor(Bh1750Settings::default());
        let t0 = Instant::now();
        dev.configure().unwrap();
        bus.lock().clear_transactions();

        assert_eq!(dev.update_at(t0), UpdateStatus::Sampled);
        assert_eq!(bus.lock().commands(ADDR), vec![POWER_ON, RESET, 0x10]);
        assert_eq!(delay.total_ms(), 248);
        assert!((lux(&dev) - 833.333).abs() < 1e-3);

        bus.lock().clear_transactions();
        assert_eq!(dev.update_at(t0 + MIN_INTERVAL), UpdateStatus::Sampled);
        assert_eq!(
            bus.lock().transactions(),
            vec![Transaction::ReadBlock {
                addr: ADDR,
                register: 0x10,
                len: 2
            }]
        );
        assert_eq!(delay.total_ms(), 248);
    }

    #[test]
    fn test_one_shot_mode_powers_down_each_cycle() {
        let settings =
            Bh1750Settings::new(Bh1750Mode::OneTimeHighRes2, 69, DEFAULT_MEASUREMENT_DELAY);
        let (mut dev, bus, _) = sensor(settings);
        let t0 = Instant::now();
        dev.update_at(t0);

        bus.lock().clear_transactions();
        assert_eq!(dev.update_at(t0 + MIN_INTERVAL), UpdateStatus::Sampled);
        assert_eq!(
            bus.lock().commands(ADDR),
            vec![POWER_ON, RESET, 0x21, POWER_DOWN]
        );
        assert_eq!(dev.state(), TriggerState::PoweredDown);
        assert!((lux(&dev) - 416.667).abs() < 1e-3);
    }

    #[test]
    fn test_sensitivity_change_forces_retrigger() {
        let (mut dev, bus, delay) = sensor(Bh1750Settings::default());
        let t0 = Instant::now();
        dev.update_at(t0);

        dev.set_sensitivity(138).unwrap();
        bus.lock().clear_transactions();
        dev.update_at(t0 + MIN_INTERVAL);
        assert_eq!(bus.lock().commands(ADDR), vec![POWER_ON, RESET, 0x10]);
        assert_eq!(delay.total_ms(), 248 + 376);
        assert!((lux(&dev) - 416.667).abs() < 1e-3);
    }

    #[test]
    fn test_failed_cycle_keeps_stale_value() {
        let (mut dev, bus, _) = sensor(Bh1750Settings::default());
        let t0 = Instant::now();
        dev.update_at(t0);

        bus.lock().fail_register(0x10);
        assert_eq!(dev.update_at(t0 + MIN_INTERVAL), UpdateStatus::Failed);
        let m = dev.measurement(Quantity::Illuminance).unwrap();
        assert!(!m.valid);
        assert!((m.value.unwrap() - 833.333).abs() < 1e-3);
        assert_eq!(dev.state(), TriggerState::Unknown);

        // Recovery goes through a full power-on/reset sequence.
        bus.lock().clear_failures();
        bus.lock().clear_transactions();
        assert_eq!(
            dev.update_at(t0 + 2 * MIN_INTERVAL),
            UpdateStatus::Sampled
        );
        assert_eq!(bus.lock().commands(ADDR), vec![POWER_ON, RESET, 0x10]);
        assert!(dev.sample_ok());
    }

    #[test]
    fn test_absent_chip_is_never_retried() {
        let bus = SharedBus::new(MockBus::new());
        let mut dev = Bh1750::new(
            bus.clone(),
            RecordingDelay::new(),
            ADDR,
            Bh1750Settings::default(),
        );
        let t0 = Instant::now();
        assert_eq!(dev.update_at(t0), UpdateStatus::Undetected);
        assert!(!dev.detected());

        bus.lock().clear_transactions();
        assert_eq!(dev.update_at(t0 + MIN_INTERVAL), UpdateStatus::Undetected);
        assert!(bus.lock().transactions().is_empty());
    }
}
