use crate::error::{BridgeError, Result};
use crate::sensors::bme280::{Filter, Mode, Oversampling, Standby};
use crate::sensors::{
    Bh1750Mode, Bh1750Settings, Bme280Settings, Htu21dResolution, Quantity, SensorModel, bh1750,
    bme280, htu21d,
};
use crate::units::TemperatureUnit;
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "SENSOR_BRIDGE_CONFIG";

/// Parse `.env` content into key/value pairs.
/// Handles values with spaces without requiring quotes.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();

            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            if !key.is_empty() {
                vars.push((key.to_string(), value.to_string()));
            }
        }
    }
    vars
}

/// Load environment variables from a `.env` file. Variables that are already
/// set win over the file.
///
/// Must run while the process is still single-threaded, before any async
/// runtime is built.
pub fn load_dotenv(path: &Path) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    for (key, value) in parse_dotenv(&content) {
        if std::env::var(&key).is_err() {
            // SAFETY: only called from `main` before any other thread exists
            unsafe { std::env::set_var(&key, value) };
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub poll: PollConfig,
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// I2C character device, e.g. `/dev/i2c-1`.
    pub device: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/i2c-1"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub temperature_unit: TemperatureUnit,
    pub json_output: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            temperature_unit: TemperatureUnit::Celsius,
            json_output: false,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// One configured chip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_address")]
    pub address: Option<u8>,
    #[serde(default)]
    pub monitored_conditions: Option<Vec<Quantity>>,
    /// Rolling average window; 1 disables smoothing.
    #[serde(default = "default_smoothing")]
    pub smoothing: usize,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(flatten)]
    pub chip: ChipConfig,
}

fn default_smoothing() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum ChipConfig {
    Bme280(Bme280Options),
    Bh1750(Bh1750Options),
    Htu21d(Htu21dOptions),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Bme280Options {
    pub oversampling_temperature: u8,
    pub oversampling_pressure: u8,
    pub oversampling_humidity: u8,
    /// 0 sleep, 1 or 2 forced, 3 normal.
    pub operation_mode: u8,
    pub time_standby: u8,
    pub filter_mode: u8,
    pub delta_temperature: f64,
}

impl Default for Bme280Options {
    fn default() -> Self {
        Self {
            oversampling_temperature: 1,
            oversampling_pressure: 1,
            oversampling_humidity: 1,
            operation_mode: 3,
            time_standby: 5,
            filter_mode: 0,
            delta_temperature: 0.0,
        }
    }
}

impl Bme280Options {
    pub fn settings(&self) -> Bme280Settings {
        Bme280Settings {
            temperature_oversampling: Oversampling::from_raw(self.oversampling_temperature),
            pressure_oversampling: Oversampling::from_raw(self.oversampling_pressure),
            humidity_oversampling: Oversampling::from_raw(self.oversampling_humidity),
            mode: Mode::from_raw(self.operation_mode),
            standby: Standby::from_raw(self.time_standby),
            filter: Filter::from_raw(self.filter_mode),
            temperature_offset: self.delta_temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Bh1750Options {
    pub operation_mode: Bh1750Mode,
    pub sensitivity: u32,
    pub measurement_delay_ms: u64,
}

impl Default for Bh1750Options {
    fn default() -> Self {
        Self {
            operation_mode: Bh1750Mode::default(),
            sensitivity: bh1750::DEFAULT_SENSITIVITY as u32,
            measurement_delay_ms: bh1750::DEFAULT_MEASUREMENT_DELAY.as_millis() as u64,
        }
    }
}

impl Bh1750Options {
    pub fn settings(&self) -> Bh1750Settings {
        Bh1750Settings::new(
            self.operation_mode,
            self.sensitivity,
            Duration::from_millis(self.measurement_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Htu21dOptions {
    pub resolution: Htu21dResolution,
}

impl SensorConfig {
    pub fn new(chip: ChipConfig) -> Self {
        Self {
            name: None,
            address: None,
            monitored_conditions: None,
            smoothing: default_smoothing(),
            precision: None,
            chip,
        }
    }

    pub fn model(&self) -> SensorModel {
        match self.chip {
            ChipConfig::Bme280(_) => SensorModel::Bme280,
            ChipConfig::Bh1750(_) => SensorModel::Bh1750,
            ChipConfig::Htu21d(_) => SensorModel::Htu21d,
        }
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| match self.model() {
            SensorModel::Bme280 => "BME280 Sensor".to_string(),
            SensorModel::Bh1750 => "BH1750 Light Sensor".to_string(),
            SensorModel::Htu21d => "HTU21D Sensor".to_string(),
        })
    }

    /// Configured address, or the chip's default. The HTU21D address is fixed.
    pub fn address(&self) -> u8 {
        match self.model() {
            SensorModel::Htu21d => htu21d::ADDRESS,
            SensorModel::Bme280 => self.address.unwrap_or(bme280::DEFAULT_ADDRESS),
            SensorModel::Bh1750 => self.address.unwrap_or(bh1750::DEFAULT_ADDRESS),
        }
    }

    pub fn quantities(&self) -> Vec<Quantity> {
        if let Some(monitored) = &self.monitored_conditions {
            return monitored.clone();
        }
        match self.model() {
            SensorModel::Bme280 => vec![
                Quantity::Temperature,
                Quantity::Humidity,
                Quantity::Pressure,
            ],
            SensorModel::Bh1750 => vec![Quantity::Illuminance],
            SensorModel::Htu21d => vec![Quantity::Temperature, Quantity::Humidity],
        }
    }

    /// Decimal places for reported values.
    pub fn precision(&self) -> u32 {
        self.precision.unwrap_or(match self.model() {
            SensorModel::Bme280 => 2,
            SensorModel::Htu21d => 1,
            SensorModel::Bh1750 => 0,
        })
    }

    fn supported(&self) -> &'static [Quantity] {
        match self.model() {
            SensorModel::Bme280 => &[
                Quantity::Temperature,
                Quantity::Humidity,
                Quantity::Pressure,
            ],
            SensorModel::Bh1750 => &[Quantity::Illuminance],
            SensorModel::Htu21d => &[
                Quantity::Temperature,
                Quantity::Humidity,
                Quantity::DewPoint,
            ],
        }
    }
}

/// Parse `"0x76"`, `"0X76"` or `"118"` as a 7-bit address.
pub fn parse_address(text: &str) -> std::result::Result<u8, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse::<u8>(),
    };
    match parsed {
        Ok(addr) if addr <= 0x7F => Ok(addr),
        _ => Err(format!("invalid I2C address {text:?}")),
    }
}

fn deserialize_address<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAddress {
        Number(u64),
        Text(String),
    }

    let raw = Option::<RawAddress>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawAddress::Number(n)) if n <= 0x7F => Ok(Some(n as u8)),
        Some(RawAddress::Number(n)) => Err(serde::de::Error::custom(format!(
            "invalid I2C address {n}"
        ))),
        Some(RawAddress::Text(text)) => parse_address(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            poll: PollConfig::default(),
            sensors: vec![SensorConfig::new(ChipConfig::Bme280(
                Bme280Options::default(),
            ))],
        }
    }
}

impl Config {
    /// `<config_dir>/i2c-sensor-bridge/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("i2c-sensor-bridge").join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the configuration file, apply environment overrides and
    /// validate the result.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(|| Self::default_path().filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => {
                info!("No configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `I2C_BUS_DEVICE`, `POLL_INTERVAL_SECS` and `TEMPERATURE_UNIT`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup("I2C_BUS_DEVICE") {
            self.bus.device = PathBuf::from(device);
        }
        if let Some(interval) = lookup("POLL_INTERVAL_SECS")
            && let Ok(secs) = interval.parse()
        {
            self.poll.interval_secs = secs;
        }
        if let Some(unit) = lookup("TEMPERATURE_UNIT") {
            match unit.parse() {
                Ok(unit) => self.poll.temperature_unit = unit,
                Err(_) => warn!("Ignoring unknown TEMPERATURE_UNIT {unit:?}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            return Err(BridgeError::Config(
                "poll.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.sensors.is_empty() {
            return Err(BridgeError::Config("no sensors configured".to_string()));
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            let address = sensor.address();
            if !seen.insert(address) {
                return Err(BridgeError::Config(format!(
                    "two sensors share address 0x{address:02x}"
                )));
            }
            if sensor.smoothing == 0 {
                return Err(BridgeError::Config(format!(
                    "{}: smoothing window must be at least 1",
                    sensor.name()
                )));
            }
            if let Some(q) = sensor
                .quantities()
                .into_iter()
                .find(|q| !sensor.supported().contains(q))
            {
                return Err(BridgeError::Config(format!(
                    "{} ({}) does not measure {q}",
                    sensor.name(),
                    sensor.model()
                )));
            }
        }
        Ok(())
    }
}
