//! `fusor_daqd`: the acquisition server. Loads settings, starts the
//! three acquirers, runs the Fuser/Recorder loop against a freshly
//! created log file, and fans each second's record out to connected
//! clients over TCP.
//!
//! Grounded on the donor `main.rs`'s init shape (logging → settings →
//! spawn workers → run → graceful shutdown) with the `eframe`/actor
//! pieces replaced by this spec's plain-thread acquirer set.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::{error, info, warn};

use fusor_daq::camera_acquirer::{CameraAcquirer, SimulatedFrameSource};
use fusor_daq::config::Settings;
use fusor_daq::error::{DaqError, DaqResult};
use fusor_daq::fast_acquirer::{FastAcquirer, SimulatedFastAdc};
use fusor_daq::fuser::{fan_out, Fuser, JpegLatch};
use fusor_daq::log_store::LogStore;
use fusor_daq::network::server::Server;
use fusor_daq::recorder::Recorder;
use fusor_daq::sample_ring::SampleRing;
use fusor_daq::serial_acquirer::{ScanlistEntry, SerialAcquirer};

/// `fusor_daqd` command line: a settings file plus the output `.dat`
/// log filename (positional, required for LIVE recording per spec.md
/// §6.3's "positional argument: output filename for LIVE mode").
#[derive(Debug, Parser)]
#[command(name = "fusor_daqd", version, about = "Fusor telemetry acquisition server")]
struct ServerCli {
    /// Path to the TOML settings file.
    #[arg(short = 'c', long = "config", default_value = "settings.toml")]
    config: PathBuf,

    /// Output log filename (must end in `.dat`, must not already exist).
    output: PathBuf,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as i64
}

fn init_logging(settings: &Settings) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| settings.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

fn run(cli: &ServerCli) -> DaqResult<()> {
    let settings = Settings::load(&cli.config).map_err(|e| DaqError::Config(e.to_string()))?;
    init_logging(&settings);
    info!(config = %cli.config.display(), "configuration loaded");

    if cli.output.extension().and_then(|e| e.to_str()) != Some("dat") {
        return Err(DaqError::InvalidConfig(format!(
            "output filename `{}` must have a .dat extension",
            cli.output.display()
        )));
    }

    // Polled at every outer loop boundary (spec.md §5); nothing in
    // this binary sets it today, so the process runs until the OS
    // terminates it, same as the donor's own daemon-mode entry point.
    // A future signal handler or embedding test harness can store
    // `true` here to drain the acquirers' cooperative shutdown paths.
    let exiting = Arc::new(AtomicBool::new(false));

    let store = LogStore::create(&cli.output, settings.storage.max_records)?;
    let mut recorder = Recorder::new(store)?;

    let mut fast_acquirer = FastAcquirer::new();
    fast_acquirer.start(Box::new(SimulatedFastAdc::default()))?;

    let scanlist: Vec<ScanlistEntry> = settings
        .serial
        .channels
        .iter()
        .map(|&adc_chan| ScanlistEntry { adc_chan })
        .collect();
    let mut serial_acquirer = SerialAcquirer::new(&scanlist, settings.serial.scan_hz, settings.serial.averaging_duration_sec);
    #[cfg(feature = "hardware_serial")]
    {
        match fusor_daq::serial_acquirer::open_hardware_port(&settings.serial.device_path) {
            Ok(channel) => {
                serial_acquirer.start(channel, &scanlist, settings.serial.scan_hz)?;
            }
            Err(e) => {
                error!(error = %e, "serial ADC device not found at init");
                return Err(e);
            }
        }
    }
    #[cfg(not(feature = "hardware_serial"))]
    {
        warn!("built without hardware_serial; SerialAcquirer rings stay at zero");
    }

    let jpeg_latch = Arc::new(JpegLatch::default());
    let mut camera_acquirer = settings.camera.enabled.then(|| {
        CameraAcquirer::new(Box::new(SimulatedFrameSource::new(1)))
    });

    let server = Server::start(&settings.network.listen_addr)?;
    let clients = server.clients();

    let mut fuser = Fuser::new(&settings.cpm.windows_sec);
    let serial_rings: Arc<Mutex<HashMap<u8, SampleRing>>> = serial_acquirer.rings();
    let detector = fast_acquirer.detector();

    info!(listen = %settings.network.listen_addr, output = %cli.output.display(), "server running");

    while !exiting.load(Ordering::Acquire) {
        if let Some(camera) = camera_acquirer.as_mut() {
            match camera.get_buff() {
                Ok(buf) => {
                    jpeg_latch.set(buf.jpeg, buf.capture_us);
                    camera.put_buff(buf.index);
                }
                Err(e) => warn!(error = %e, "camera grab failed"),
            }
        } else {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        serial_acquirer.sync_ring_scan_okay();

        let now = now_secs();
        if let Some(record) = fuser.tick(now, now_micros(), &serial_rings, &detector, &jpeg_latch) {
            let restarts = fast_acquirer.take_restart_count();
            if restarts > 0 {
                info!(restarts, "USB bulk endpoint restarted since last second");
            }
            {
                let clients = clients.lock().expect("client registry mutex poisoned");
                fan_out(&record, &clients);
            }
            if let Err(e) = recorder.record(record) {
                error!(error = %e, "Recorder failed, exiting");
                return Err(e);
            }
        }
    }

    info!("shutdown requested, stopping acquirers");
    fast_acquirer.stop();
    serial_acquirer.stop();
    Ok(())
}

fn main() {
    let cli = ServerCli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("fusor_daqd: fatal: {e}");
        std::process::exit(1);
    }
}
