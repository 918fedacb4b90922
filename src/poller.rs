//! Periodic polling of the configured sensors.
//!
//! [`SensorPoller`] owns one [`SensorEntry`] per configured chip and turns
//! driver measurements into [`Reading`]s: smoothed, converted to the
//! configured temperature unit and rounded. [`run_poller`] drives it from a
//! tokio interval on the blocking thread pool, since the drivers sleep while
//! conversions run.

use crate::bus::{SharedBus, SmBus};
use crate::config::{ChipConfig, SensorConfig};
use crate::sensors::{
    Bh1750, Bme280, Htu21d, Quantity, RollingAverage, Sensor, SensorModel, UpdateStatus,
};
use crate::units::{TemperatureUnit, round_to};
use chrono::{DateTime, Utc};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// One reported value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub sensor: String,
    pub quantity: Quantity,
    /// Last good value, kept while the sensor is unavailable.
    pub value: Option<f64>,
    pub unit: &'static str,
    pub available: bool,
    pub timestamp: DateTime<Utc>,
}

struct Channel {
    quantity: Quantity,
    average: RollingAverage,
    last: Option<f64>,
}

pub struct SensorEntry {
    name: String,
    sensor: Box<dyn Sensor>,
    channels: Vec<Channel>,
    precision: u32,
}

impl SensorEntry {
    pub fn new(
        name: impl Into<String>,
        sensor: Box<dyn Sensor>,
        quantities: &[Quantity],
        smoothing: usize,
        precision: u32,
    ) -> Self {
        Self {
            name: name.into(),
            sensor,
            channels: quantities
                .iter()
                .map(|q| Channel {
                    quantity: *q,
                    average: RollingAverage::new(smoothing),
                    last: None,
                })
                .collect(),
            precision,
        }
    }

    /// Build the driver described by `config` on a shared bus.
    pub fn from_config<B, D>(config: &SensorConfig, bus: SharedBus<B>, delay: D) -> Self
    where
        B: SmBus + Send + 'static,
        D: DelayNs + Send + 'static,
    {
        let address = config.address();
        let sensor: Box<dyn Sensor> = match &config.chip {
            ChipConfig::Bme280(options) => {
                Box::new(Bme280::new(bus, delay, address, options.settings()))
            }
            ChipConfig::Bh1750(options) => {
                Box::new(Bh1750::new(bus, delay, address, options.settings()))
            }
            ChipConfig::Htu21d(options) => Box::new(Htu21d::new(bus, delay, options.resolution)),
        };
        Self::new(
            config.name(),
            sensor,
            &config.quantities(),
            config.smoothing,
            config.precision(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> SensorModel {
        self.sensor.model()
    }

    pub fn address(&self) -> u8 {
        self.sensor.address()
    }

    pub fn detected(&self) -> bool {
        self.sensor.detected()
    }

    fn poll(
        &mut self,
        now: Instant,
        unit: TemperatureUnit,
        timestamp: DateTime<Utc>,
    ) -> Option<Vec<Reading>> {
        let status = self.sensor.update_at(now);
        match status {
            UpdateStatus::Undetected => return None,
            UpdateStatus::Failed => warn!("Bad update of sensor.{}", self.name),
            UpdateStatus::Throttled => debug!("sensor.{} throttled", self.name),
            UpdateStatus::Sampled => {}
        }

        let readings = self
            .channels
            .iter_mut()
            .map(|channel| {
                let measurement = self.sensor.measurement(channel.quantity);
                let valid = measurement.is_some_and(|m| m.valid);
                if status == UpdateStatus::Sampled
                    && let Some(value) = measurement.and_then(|m| m.valid_value())
                {
                    let smoothed = channel.average.push(value);
                    let converted = if channel.quantity.is_temperature() {
                        unit.from_celsius(smoothed)
                    } else {
                        smoothed
                    };
                    channel.last = Some(round_to(converted, self.precision));
                }
                Reading {
                    sensor: self.name.clone(),
                    quantity: channel.quantity,
                    value: channel.last,
                    unit: if channel.quantity.is_temperature() {
                        unit.symbol()
                    } else {
                        channel.quantity.unit()
                    },
                    available: valid,
                    timestamp,
                }
            })
            .collect();
        Some(readings)
    }
}

pub struct SensorPoller {
    entries: Vec<SensorEntry>,
    unit: TemperatureUnit,
}

impl SensorPoller {
    pub fn new(entries: Vec<SensorEntry>, unit: TemperatureUnit) -> Self {
        Self { entries, unit }
    }

    /// Build one entry per configured sensor, all sharing `bus`.
    pub fn from_configs<B, D, F>(
        configs: &[SensorConfig],
        bus: &SharedBus<B>,
        make_delay: F,
        unit: TemperatureUnit,
    ) -> Self
    where
        B: SmBus + Send + 'static,
        D: DelayNs + Send + 'static,
        F: Fn() -> D,
    {
        let entries = configs
            .iter()
            .map(|config| SensorEntry::from_config(config, bus.clone(), make_delay()))
            .collect();
        Self::new(entries, unit)
    }

    pub fn entries(&self) -> &[SensorEntry] {
        &self.entries
    }

    /// Initialise every sensor and return how many answered.
    pub fn detect(&mut self) -> usize {
        let mut found = 0;
        for entry in &mut self.entries {
            match entry.sensor.configure() {
                Ok(()) => {
                    info!(
                        "{} ({}) ready at 0x{:02x}",
                        entry.name,
                        entry.model(),
                        entry.address()
                    );
                    found += 1;
                }
                Err(e) => error!(
                    "{} ({}) not detected at 0x{:02x}: {}",
                    entry.name,
                    entry.model(),
                    entry.address(),
                    e
                ),
            }
        }
        found
    }

    /// Update every sensor once. Undetected sensors produce no readings.
    pub fn poll_once(&mut self, now: Instant) -> Vec<Reading> {
        let timestamp = Utc::now();
        let unit = self.unit;
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.poll(now, unit, timestamp))
            .flatten()
            .collect()
    }
}

/// Spawn a task that polls every `period` and sends each batch of readings.
///
/// The task ends when the receiver is dropped; abort the returned handle to
/// stop it earlier.
pub fn run_poller(
    poller: SensorPoller,
    period: Duration,
    sender: mpsc::Sender<Vec<Reading>>,
) -> JoinHandle<()> {
    let poller = Arc::new(Mutex::new(poller));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let poller = poller.clone();
            let batch =
                tokio::task::spawn_blocking(move || poller.lock().poll_once(Instant::now())).await;
            match batch {
                Ok(readings) => {
                    if sender.send(readings).await.is_err() {
                        debug!("Reading receiver closed, stopping poller");
                        break;
                    }
                }
                Err(e) => {
                    error!("Poll task failed: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, RecordingDelay};
    use crate::config::{Bh1750Options, Htu21dOptions};
    use crate::sensors::htu21d;

    const LIGHT: u8 = 0x23;

    fn light_bus(count: u16) -> SharedBus<MockBus> {
        let mut mock = MockBus::new();
        mock.set_block(LIGHT, 0x10, &count.to_be_bytes());
        SharedBus::new(mock)
    }

    fn set_count(bus: &SharedBus<MockBus>, count: u16) {
        bus.lock().set_block(LIGHT, 0x10, &count.to_be_bytes());
    }

    fn light_poller(bus: &SharedBus<MockBus>, smoothing: usize) -> SensorPoller {
        let mut config = SensorConfig::new(ChipConfig::Bh1750(Bh1750Options::default()));
        config.smoothing = smoothing;
        config.name = Some("desk".to_string());
        SensorPoller::from_configs(
            &[config],
            bus,
            RecordingDelay::new,
            TemperatureUnit::Celsius,
        )
    }

    #[test]
    fn test_poll_once_reports_rounded_values() {
        let bus = light_bus(1000);
        let mut poller = light_poller(&bus, 1);
        assert_eq!(poller.detect(), 1);

        let readings = poller.poll_once(Instant::now());
        assert_eq!(readings.len(), 1);
        let r = &readings[0];
        assert_eq!(r.sensor, "desk");
        assert_eq!(r.quantity, Quantity::Illuminance);
        assert_eq!(r.value, Some(833.0));
        assert_eq!(r.unit, "lx");
        assert!(r.available);
    }

    #[test]
    fn test_smoothing_and_throttled_polls() {
        let bus = light_bus(1200);
        let mut poller = light_poller(&bus, 2);
        let t0 = Instant::now();
        assert_eq!(poller.poll_once(t0)[0].value, Some(1000.0));

        set_count(&bus, 2400);
        // Throttled: the average must not take the same sample twice.
        assert_eq!(poller.poll_once(t0)[0].value, Some(1000.0));
        let later = poller.poll_once(t0 + Duration::from_secs(1));
        assert_eq!(later[0].value, Some(1500.0));
    }

    #[test]
    fn test_failed_update_keeps_last_value_unavailable() {
        let bus = light_bus(1200);
        let mut poller = light_poller(&bus, 1);
        let t0 = Instant::now();
        poller.poll_once(t0);

        bus.lock().fail_register(0x10);
        let readings = poller.poll_once(t0 + Duration::from_secs(1));
        assert_eq!(readings[0].value, Some(1000.0));
        assert!(!readings[0].available);
    }

    #[test]
    fn test_undetected_sensor_is_skipped() {
        let bus = light_bus(1000);
        let htu = SensorConfig::new(ChipConfig::Htu21d(Htu21dOptions::default()));
        let light = SensorConfig::new(ChipConfig::Bh1750(Bh1750Options::default()));
        let mut poller = SensorPoller::from_configs(
            &[htu, light],
            &bus,
            RecordingDelay::new,
            TemperatureUnit::Celsius,
        );
        assert_eq!(poller.detect(), 1);
        assert!(!poller.entries()[0].detected());
        assert_eq!(poller.entries()[0].address(), htu21d::ADDRESS);

        let readings = poller.poll_once(Instant::now());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor, "BH1750 Light Sensor");
    }

    #[test]
    fn test_fahrenheit_conversion() {
        let mut mock = MockBus::new();
        mock.set_block(htu21d::ADDRESS, 0xE7, &[0x02]);
        mock.queue_read(htu21d::ADDRESS, &[0x68, 0x3A, 0x7C]);
        mock.queue_read(htu21d::ADDRESS, &[0x4E, 0x85, 0x6B]);
        let bus = SharedBus::new(mock);
        let mut config = SensorConfig::new(ChipConfig::Htu21d(Htu21dOptions::default()));
        config.monitored_conditions = Some(vec![Quantity::Temperature, Quantity::DewPoint]);
        let mut poller = SensorPoller::from_configs(
            &[config],
            &bus,
            RecordingDelay::new,
            TemperatureUnit::Fahrenheit,
        );

        let readings = poller.poll_once(Instant::now());
        assert_eq!(readings.len(), 2);
        // 24.6864 °C, 7.0825 °C
        assert_eq!(readings[0].value, Some(76.4));
        assert_eq!(readings[0].unit, "°F");
        assert_eq!(readings[1].quantity, Quantity::DewPoint);
        assert_eq!(readings[1].value, Some(44.7));
    }

    #[test]
    fn test_reading_serializes_as_json_line() {
        let reading = Reading {
            sensor: "desk".to_string(),
            quantity: Quantity::DewPoint,
            value: None,
            unit: "°C",
            available: false,
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("\"quantity\":\"dew_point\""));
        assert!(json.contains("\"value\":null"));
        assert!(json.contains("1970-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_run_poller_sends_batches() {
        let bus = light_bus(1000);
        let poller = light_poller(&bus, 1);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = run_poller(poller, Duration::from_millis(10), tx);

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, Some(833.0));

        drop(rx);
        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
        tokio_test::assert_ok!(finished.unwrap());
    }
}
