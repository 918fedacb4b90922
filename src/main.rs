use clap::Parser;
use i2c_sensor_bridge::bus::open_linux_bus;
use i2c_sensor_bridge::config::{CONFIG_PATH_ENV, Config, load_dotenv};
use i2c_sensor_bridge::error::{BridgeError, Result};
use i2c_sensor_bridge::instance_lock::InstanceLock;
use i2c_sensor_bridge::poller::{Reading, SensorPoller, run_poller};
use linux_embedded_hal::Delay;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "i2c-sensor-bridge")]
#[command(about = "Poll I2C environmental sensors and report their readings")]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Poll interval in seconds (overrides the configuration)
    #[arg(long)]
    interval: Option<u64>,

    /// Print each reading as a JSON line on stdout
    #[arg(long)]
    json: bool,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn emit(reading: &Reading, json: bool) {
    if json {
        match serde_json::to_string(reading) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("Failed to encode reading: {}", e),
        }
        return;
    }
    match (reading.value, reading.available) {
        (Some(value), true) => info!(
            "{} {}: {} {}",
            reading.sensor, reading.quantity, value, reading.unit
        ),
        (Some(value), false) => info!(
            "{} {}: {} {} (stale)",
            reading.sensor, reading.quantity, value, reading.unit
        ),
        (None, _) => info!("{} {}: unavailable", reading.sensor, reading.quantity),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(secs) = cli.interval {
        config.poll.interval_secs = secs;
    }
    if cli.json {
        config.poll.json_output = true;
    }
    config.validate()?;

    info!("Configuration loaded:");
    info!("  Bus: {}", config.bus.device.display());
    info!("  Interval: {}s", config.poll.interval_secs);
    info!("  Temperature unit: {}", config.poll.temperature_unit);
    info!("  Sensors: {}", config.sensors.len());

    let _lock = InstanceLock::acquire(&config.bus.device)?;
    let bus = open_linux_bus(&config.bus.device)?;

    let mut poller = SensorPoller::from_configs(
        &config.sensors,
        &bus,
        || Delay,
        config.poll.temperature_unit,
    );
    let detected = tokio::task::spawn_blocking(move || {
        let found = poller.detect();
        (poller, found)
    })
    .await;
    let (poller, found) = detected.map_err(|e| BridgeError::Task(e.to_string()))?;
    if found == 0 {
        return Err(BridgeError::Config(format!(
            "none of the {} configured sensors answered on {}",
            config.sensors.len(),
            config.bus.device.display()
        )));
    }
    info!(
        "{} of {} sensors detected, press Ctrl+C to exit",
        found,
        config.sensors.len()
    );

    let (tx, mut rx) = mpsc::channel(16);
    let handle = run_poller(poller, config.poll.interval(), tx);
    let json = config.poll.json_output;

    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(readings) => readings.iter().for_each(|r| emit(r, json)),
                None => break,
            },
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
        }
    }

    handle.abort();
    info!("I2C sensor bridge stopped");
    Ok(())
}

fn main() -> ExitCode {
    // The runtime's worker threads must not exist yet while `.env` is applied.
    load_dotenv(Path::new(".env"));
    init_logger();
    info!("Starting I2C sensor bridge");
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
