//! Development tool for checking sensor wiring.
//!
//! Usage:
//!   cargo run --bin sensor-probe -- scan
//!   cargo run --bin sensor-probe -- read bme280 --address 0x77
//!   cargo run --bin sensor-probe -- read htu21d

use clap::{Parser, Subcommand, ValueEnum};
use i2c_sensor_bridge::bus::{SCAN_RANGE, open_linux_bus, scan};
use i2c_sensor_bridge::config::{
    Bh1750Options, Bme280Options, ChipConfig, Htu21dOptions, SensorConfig, parse_address,
};
use i2c_sensor_bridge::poller::SensorPoller;
use i2c_sensor_bridge::sensors::{Quantity, bh1750, bme280, htu21d};
use i2c_sensor_bridge::units::TemperatureUnit;
use linux_embedded_hal::Delay;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "sensor-probe")]
#[command(about = "Scan an I2C bus or read a single sensor once")]
struct Cli {
    /// I2C character device
    #[arg(long, env = "I2C_BUS_DEVICE", default_value = "/dev/i2c-1")]
    bus: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the addresses that acknowledge a read
    Scan,
    /// Initialise one sensor, take a single measurement and print it
    Read {
        model: Model,

        /// Override the default address (e.g. 0x77)
        #[arg(long, value_parser = parse_address)]
        address: Option<u8>,

        /// Print readings as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Model {
    Bme280,
    Bh1750,
    Htu21d,
}

fn known_chip(addr: u8) -> Option<&'static str> {
    match addr {
        bme280::DEFAULT_ADDRESS | bme280::ALTERNATE_ADDRESS => Some("BME280"),
        bh1750::DEFAULT_ADDRESS | bh1750::ALTERNATE_ADDRESS => Some("BH1750"),
        htu21d::ADDRESS => Some("HTU21D"),
        _ => None,
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let bus = open_linux_bus(&cli.bus)?;

    match cli.command {
        Commands::Scan => {
            let found = scan(&mut *bus.lock(), SCAN_RANGE);
            if found.is_empty() {
                println!("No devices found on {}", cli.bus.display());
            }
            for addr in found {
                match known_chip(addr) {
                    Some(chip) => println!("0x{addr:02x}  (likely {chip})"),
                    None => println!("0x{addr:02x}"),
                }
            }
        }
        Commands::Read {
            model,
            address,
            json,
        } => {
            let chip = match model {
                Model::Bme280 => ChipConfig::Bme280(Bme280Options::default()),
                Model::Bh1750 => ChipConfig::Bh1750(Bh1750Options::default()),
                Model::Htu21d => ChipConfig::Htu21d(Htu21dOptions::default()),
            };
            let mut config = SensorConfig::new(chip);
            config.address = address;
            if matches!(model, Model::Htu21d) {
                config.monitored_conditions = Some(vec![
                    Quantity::Temperature,
                    Quantity::Humidity,
                    Quantity::DewPoint,
                ]);
            }

            let mut poller =
                SensorPoller::from_configs(&[config], &bus, || Delay, TemperatureUnit::Celsius);
            if poller.detect() == 0 {
                let model = poller.entries()[0].model();
                return Err(format!("no {model} answered on {}", cli.bus.display()).into());
            }
            for reading in poller.poll_once(Instant::now()) {
                if json {
                    println!("{}", serde_json::to_string(&reading)?);
                } else {
                    let quantity = reading.quantity.to_string();
                    match reading.value {
                        Some(value) => println!("{quantity:<12} {value} {}", reading.unit),
                        None => println!("{quantity:<12} unavailable"),
                    }
                }
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
