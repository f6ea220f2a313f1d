//! phsense command-line client
//!
//! Scans for BLE pH sensors, streams readings, sends buffer calibrations
//! and prints recorded history.
//!
//! # Usage
//!
//! ```bash
//! # List sensors around (simulated by default)
//! phsense scan
//!
//! # Stream readings from real hardware and record them
//! phsense --device ble monitor --record ph.db
//!
//! # Two-point calibration of the first sensor found
//! phsense calibrate --ph4 2.03 --ph7 1.51
//!
//! # Readings from the last week
//! phsense history --window week --db ph.db
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use phsense_core::calibration::CalibrationInput;
use phsense_core::protocol::SampleFormat;
use phsense_core::types::DeviceId;
use phsense_native::bridge::{
    BlePlatform, ManagerEvent, RegistrySnapshot, ScanFilterConfig, SessionConfig, SessionManager,
    SimulatedPlatform,
};
#[cfg(feature = "database")]
use phsense_native::history::TimeWindow;
use phsense_native::history::HistoryRecorder;

/// phsense pH sensor client
#[derive(Parser, Debug)]
#[command(name = "phsense")]
#[command(author, version, about = "BLE pH sensor client", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Device connection type: ble or simulate
    #[arg(short, long, default_value = "simulate")]
    device: String,

    /// Connect timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// Only list peripherals whose name starts with this prefix (empty = all)
    #[arg(long, default_value = "pH")]
    name_prefix: String,

    /// Sensor firmware sends readings as decimal text
    #[arg(long)]
    text_samples: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List discovered sensors
    Scan {
        /// How long to listen for advertisements
        #[arg(long, default_value = "5")]
        duration_secs: u64,
    },

    /// Connect and stream pH readings until interrupted
    Monitor {
        #[command(flatten)]
        target: TargetArgs,

        /// Record readings into this SQLite database
        #[arg(long)]
        record: Option<PathBuf>,

        /// Stop after this many readings
        #[arg(long)]
        samples: Option<u64>,
    },

    /// Connect and send buffer calibration
    Calibrate {
        #[command(flatten)]
        target: TargetArgs,

        /// Voltage measured in pH 4.0 buffer
        #[arg(long)]
        ph4: String,

        /// Voltage measured in pH 7.0 buffer
        #[arg(long)]
        ph7: String,

        /// Voltage measured in pH 10.0 buffer
        #[arg(long)]
        ph10: Option<String>,
    },

    /// Print recorded readings
    History {
        /// Time window to print
        #[arg(short, long, value_enum, default_value = "day")]
        window: WindowArg,

        /// SQLite database written by `monitor --record`
        #[arg(long)]
        db: PathBuf,
    },
}

/// Which sensor to use. Defaults to the first one found.
#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Peripheral id as reported by `scan`
    #[arg(long, conflicts_with = "name")]
    device_id: Option<String>,

    /// Advertised name
    #[arg(long)]
    name: Option<String>,

    /// How long to wait for the sensor to show up
    #[arg(long, default_value = "15")]
    discovery_secs: u64,
}

impl TargetArgs {
    fn pick(&self, devices: &RegistrySnapshot) -> Option<DeviceId> {
        match (&self.device_id, &self.name) {
            (Some(id), _) => devices.get(&DeviceId::new(id.as_str())).map(|r| r.id.clone()),
            (None, Some(name)) => devices
                .iter()
                .find(|r| r.name.as_deref() == Some(name.as_str()))
                .map(|r| r.id.clone()),
            (None, None) => devices.sorted_for_display().first().map(|r| r.id.clone()),
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum WindowArg {
    Day,
    Week,
    Custom,
}

#[cfg(feature = "database")]
impl WindowArg {
    fn window(self) -> TimeWindow {
        match self {
            Self::Day => TimeWindow::day(),
            Self::Week => TimeWindow::week(),
            Self::Custom => TimeWindow::custom(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("phsense v{}", env!("CARGO_PKG_VERSION"));

    let rt = Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = session_config(&cli);
    match cli.command {
        Commands::History { window, db } => print_history(window, &db),
        Commands::Scan { duration_secs } => {
            let manager = start_manager(&cli.device, config).await?;
            let result = scan(&manager, Duration::from_secs(duration_secs)).await;
            manager.shutdown().await;
            result
        }
        Commands::Monitor {
            target,
            record,
            samples,
        } => {
            let manager = start_manager(&cli.device, config).await?;
            let result = monitor(&manager, &target, record, samples).await;
            manager.shutdown().await;
            result
        }
        Commands::Calibrate {
            target,
            ph4,
            ph7,
            ph10,
        } => {
            let input = CalibrationInput::new(ph4, ph7, ph10.unwrap_or_default());
            // Reject bad input before touching the radio
            input.coefficients()?;

            let manager = start_manager(&cli.device, config).await?;
            let result = calibrate(&manager, &target, &input).await;
            manager.shutdown().await;
            result
        }
    }
}

fn session_config(cli: &Cli) -> SessionConfig {
    let name_prefix = Some(cli.name_prefix.clone()).filter(|p| !p.is_empty());
    SessionConfig {
        connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
        sample_format: if cli.text_samples {
            SampleFormat::Utf8Text
        } else {
            SampleFormat::Float32Le
        },
        scan: ScanFilterConfig {
            name_prefix,
            require_service: cli.device == "ble",
        },
        ..SessionConfig::default()
    }
}

async fn start_manager(device: &str, config: SessionConfig) -> anyhow::Result<SessionManager> {
    let platform = open_platform(device, config.event_capacity).await?;
    Ok(SessionManager::start(platform, config).await?)
}

async fn open_platform(device: &str, capacity: usize) -> anyhow::Result<Arc<dyn BlePlatform>> {
    match device {
        "simulate" => {
            info!("Using simulated sensors");
            Ok(Arc::new(SimulatedPlatform::demo()))
        }
        "ble" => open_ble(capacity).await,
        other => anyhow::bail!("Unknown device type '{other}', expected ble or simulate"),
    }
}

#[cfg(feature = "ble")]
async fn open_ble(capacity: usize) -> anyhow::Result<Arc<dyn BlePlatform>> {
    let platform = phsense_native::bridge::BtleplugPlatform::new(capacity).await?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "ble"))]
#[allow(clippy::unused_async)]
async fn open_ble(_capacity: usize) -> anyhow::Result<Arc<dyn BlePlatform>> {
    anyhow::bail!(
        "BLE support not enabled. Rebuild with --features ble:\n\
         cargo run -p phsense-app --features ble"
    );
}

// ============================================================================
// Commands
// ============================================================================

async fn scan(manager: &SessionManager, duration: Duration) -> anyhow::Result<()> {
    info!("Scanning for {}s...", duration.as_secs());
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let devices = manager.devices();
    if devices.is_empty() {
        warn!("No sensors found");
    }
    for record in devices.iter() {
        let rssi = record.rssi.map_or_else(|| "?".to_string(), |r| r.to_string());
        info!("{}  {}  {} dBm", record.id, record.display_name(), rssi);
    }
    Ok(())
}

async fn monitor(
    manager: &SessionManager,
    target: &TargetArgs,
    record: Option<PathBuf>,
    limit: Option<u64>,
) -> anyhow::Result<()> {
    let mut events = manager.subscribe();
    let recorder = match record {
        Some(path) => Some(start_recorder(manager, &path)?),
        None => None,
    };

    let id = find_device(manager, target).await?;
    manager.connect(&id).await?;
    info!("Streaming pH from {id} (Ctrl-C to stop)");

    let mut received = 0u64;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ManagerEvent::Sample(sample)) => {
                    info!("{}  pH {:.2}", sample.device_id, sample.value);
                    received += 1;
                    if limit.is_some_and(|limit| received >= limit) {
                        break;
                    }
                }
                Ok(ManagerEvent::Disconnected { device_id, unsolicited: true }) => {
                    warn!("{device_id} dropped the connection");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Display fell behind, {skipped} events skipped"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    manager.disconnect(&id).await?;
    if let Some(recorder) = recorder {
        let stored = recorder.finish().await;
        info!("Recorded {stored} readings");
    }
    info!("Received {received} readings");
    Ok(())
}

async fn calibrate(
    manager: &SessionManager,
    target: &TargetArgs,
    input: &CalibrationInput,
) -> anyhow::Result<()> {
    let id = find_device(manager, target).await?;
    manager.connect(&id).await?;

    let coefficients = manager.calibrate_active(input).await?;
    info!(
        "Calibrated {id}: pH = {:.4} * V + {:.4}",
        coefficients.slope(),
        coefficients.intercept()
    );

    manager.disconnect(&id).await?;
    Ok(())
}

/// Wait until the target shows up in the registry.
async fn find_device(manager: &SessionManager, target: &TargetArgs) -> anyhow::Result<DeviceId> {
    let limit = Duration::from_secs(target.discovery_secs);
    let deadline = tokio::time::Instant::now() + limit;
    let mut events = manager.subscribe();

    loop {
        if let Some(id) = target.pick(&manager.devices()) {
            return Ok(id);
        }
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => anyhow::bail!("No matching sensor found within {}s", limit.as_secs()),
            Ok(Err(RecvError::Closed)) => anyhow::bail!("Session manager stopped"),
            Ok(_) => {}
        }
    }
}

// ============================================================================
// History
// ============================================================================

#[cfg(feature = "database")]
fn start_recorder(manager: &SessionManager, path: &std::path::Path) -> anyhow::Result<HistoryRecorder> {
    use phsense_native::history::SqliteHistory;

    let store = Arc::new(SqliteHistory::open(path)?);
    info!("Recording readings to {}", path.display());
    Ok(HistoryRecorder::spawn(manager.subscribe(), store))
}

#[cfg(not(feature = "database"))]
fn start_recorder(_manager: &SessionManager, _path: &std::path::Path) -> anyhow::Result<HistoryRecorder> {
    anyhow::bail!(
        "Recording not enabled. Rebuild with --features database:\n\
         cargo run -p phsense-app --features database"
    );
}

#[cfg(feature = "database")]
fn print_history(window: WindowArg, db: &std::path::Path) -> anyhow::Result<()> {
    use phsense_native::history::{HistoryStore, SqliteHistory};

    let store = SqliteHistory::open(db)?;
    let samples = store.query(window.window())?;
    info!("{} readings in the last {:?} window", samples.len(), window);
    for sample in &samples {
        info!("{}  {}  pH {:.2}", sample.timestamp_ms, sample.device_id, sample.value);
    }
    Ok(())
}

#[cfg(not(feature = "database"))]
fn print_history(_window: WindowArg, _db: &std::path::Path) -> anyhow::Result<()> {
    anyhow::bail!(
        "History not enabled. Rebuild with --features database:\n\
         cargo run -p phsense-app --features database"
    );
}
