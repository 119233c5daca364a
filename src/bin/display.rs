//! `fusor_display`: the headless display client. Owns the LIVE/PLAYBACK
//! state machine ([`fusor_daq::display::driver::DisplayDriver`]) and
//! the live-acquisition/local-mirror log file; actual pixel rendering
//! is the out-of-scope GUI toolkit collaborator (spec.md §1), so this
//! binary drives the state machine against a minimal stdin-based event
//! source and logs cursor transitions instead of painting them.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::Parser;
use tracing::{error, info, warn};

use fusor_daq::cli::Cli;
use fusor_daq::config::Settings;
use fusor_daq::display::driver::{DisplayDriver, Mode};
use fusor_daq::display::events::{dispatch, Action, Key, Modifiers};
use fusor_daq::error::DaqResult;
use fusor_daq::log_store::LogStore;
use fusor_daq::network::client;
use fusor_daq::record::GaugeReading;
use fusor_daq::recorder::Recorder;

/// Matches the default in [`fusor_daq::config::StorageSettings`]; a
/// played-back or live-mirrored file must be opened with the same
/// `max_records` it was created with.
fn default_max_records() -> u32 {
    Settings::default().storage.max_records
}

/// Writes a synthetic log file of `duration_secs` seconds of sentinel
/// (no-camera, no-pulse) records, for `-t SECS`. Grounded on spec.md
/// §6.3's `-t` flag and the Recorder's own gap-fill record shape.
fn generate_test_file(path: &Path, duration_secs: u64) -> DaqResult<()> {
    use fusor_daq::record::{Part1, Part2, MAGIC_DATA_PART1, MAX_CHANNEL};

    let store = LogStore::create(path, default_max_records())?;
    let mut recorder = Recorder::new(store)?;
    let start = 0i64;
    for t in 0..duration_secs as i64 {
        let phase = (t % 10) as f32 / 10.0;
        let part1 = Part1 {
            magic: MAGIC_DATA_PART1,
            time: start + t,
            voltage_mean_kv: 10.0 + phase,
            voltage_min_kv: 9.5 + phase,
            voltage_max_kv: 10.5 + phase,
            current_ma: 5.0 + phase,
            pressure_d2_mtorr: 100.0,
            pressure_n2_mtorr: 120.0,
            cpm: [[phase * 10.0; MAX_CHANNEL]; 5],
            data_part2_offset: 0,
            data_part2_length: Part2::HEADER_AND_TRACE_SIZE as u32,
            channel_valid: [1; 4],
            jpeg_valid: 0,
        };
        recorder.record(fusor_daq::record::Record {
            part1,
            part2: Part2::empty(),
        })?;
    }
    info!(path = %path.display(), duration_secs, "synthetic test file written");
    Ok(())
}

/// Formats a gauge reading for a headless render, substituting the
/// short sentinel labels spec.md §3 calls for instead of numerics.
fn format_gauge(raw: f32) -> String {
    match GaugeReading::from_wire_f32(raw) {
        GaugeReading::Value(v) => format!("{v:.3}"),
        GaugeReading::Faulty => "FAULTY".to_string(),
        GaugeReading::OverPressure => "OVPRES".to_string(),
        GaugeReading::NoValue => "NOVAL".to_string(),
    }
}

/// Renders a record's epoch-seconds `time` field as a local wall-clock
/// timestamp for human-facing log output, the way the donor's own
/// log capture formatted entries for its operator-facing views.
fn format_local_time(epoch_secs: i64) -> String {
    match Local.timestamp_opt(epoch_secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%:z").to_string(),
        None => format!("<invalid:{epoch_secs}>"),
    }
}

fn render_cursor(store: &LogStore, driver: &DisplayDriver) {
    let idx = driver.file_idx();
    if idx >= store.max() {
        return;
    }
    match store.read_part1(idx) {
        Ok(part1) => info!(
            mode = ?driver.mode(),
            idx,
            time = part1.time,
            local_time = %format_local_time(part1.time),
            voltage_kv = %format_gauge(part1.voltage_mean_kv),
            current_ma = %format_gauge(part1.current_ma),
            "cursor"
        ),
        Err(e) => warn!(idx, error = %e, "failed to read cursor record"),
    }
}

/// Maps one stdin line to a [`Key`]/[`Modifiers`] pair, mirroring
/// spec.md §6.4's key table for a terminal that can't deliver raw key
/// events. `C-<key>` / `A-<key>` prefixes stand in for Ctrl/Alt.
fn parse_line(line: &str) -> Option<(Key, Modifiers)> {
    let (prefix, rest) = if let Some(r) = line.strip_prefix("C-") {
        (Modifiers { ctrl: true, alt: false }, r)
    } else if let Some(r) = line.strip_prefix("A-") {
        (Modifiers { ctrl: false, alt: true }, r)
    } else {
        (Modifiers::default(), line)
    };
    let key = match rest {
        "esc" => Key::Esc,
        "?" => Key::Question,
        "s" | "S" => Key::CycleGraph,
        "left" => Key::ArrowLeft,
        "right" => Key::ArrowRight,
        "home" => Key::Home,
        "end" => Key::End,
        "+" | "=" => Key::ZoomIn,
        "-" => Key::ZoomOut,
        "1" => Key::YScale1,
        "2" => Key::YScale2,
        "p" if prefix.ctrl => Key::Screenshot,
        _ => return None,
    };
    Some((key, prefix))
}

fn run(cli: &Cli) -> DaqResult<()> {
    let exiting = Arc::new(AtomicBool::new(false));

    if let Some(secs) = cli.test_file_secs {
        let path = cli
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from("test.dat"));
        return generate_test_file(&path, secs);
    }

    let max_records = default_max_records();
    let (store_path, initially_live_mode) = match &cli.playback {
        Some(path) => (path.clone(), false),
        None => (
            cli.output
                .clone()
                .expect("LIVE mode requires a positional output filename"),
            true,
        ),
    };

    let store = if initially_live_mode {
        LogStore::create(&store_path, max_records)?
    } else {
        LogStore::open(&store_path, max_records)?
    };

    // The live-acquisition thread owns a second, independent mapping of
    // the same file for its writer role; both mappings are MAP_SHARED,
    // so the `max` fence each publishes through is visible through the
    // other (same backing pages), exactly as it would be for an
    // out-of-process reader attached to the same file.
    let mut live_handle = None;
    if initially_live_mode {
        let server_addr = cli
            .server
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", fusor_daq::record::SERVER_PORT));
        let mut recorder = Recorder::new(LogStore::open(&store_path, max_records)?)?;
        let live_exiting = Arc::clone(&exiting);
        live_handle = Some(std::thread::spawn(move || {
            if let Err(e) = client::run(&server_addr, &mut recorder, None, &live_exiting) {
                error!(error = %e, "live-acquisition thread exited");
            }
        }));
    }

    let mut driver = DisplayDriver::new(initially_live_mode, store.max());
    render_cursor(&store, &driver);

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if exiting.load(Ordering::Acquire) {
            break;
        }
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, modifiers)) = parse_line(line) else {
            warn!(line, "unrecognized input");
            continue;
        };
        let Some(action) = dispatch(key, modifiers) else {
            continue;
        };

        let max = store.max();
        match action {
            Action::Quit => break,
            Action::ShowAbout => info!("fusor_display: live/playback telemetry viewer"),
            Action::CycleGraph => info!("cycling displayed graph"),
            Action::StepCursor(direction, step) => driver.step_cursor(direction, step, max),
            Action::JumpHome => driver.jump_home(),
            Action::JumpEnd => driver.jump_end(max),
            Action::ScaleX(scale) => info!(?scale, "x-scale changed"),
            Action::ScaleY(scale) => info!(?scale, "y-scale changed"),
            Action::Screenshot => warn!("screenshot requested: PNG writer is out of scope"),
        }

        driver.on_max_advanced(store.max());
        if driver.mode() == Mode::Playback && driver.file_idx() + 1 >= store.max() {
            driver.on_right_edge_reached(store.max());
        }
        render_cursor(&store, &driver);
    }

    exiting.store(true, Ordering::Release);
    if let Some(handle) = live_handle {
        let _ = handle.join();
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    if let Err(e) = run(&cli) {
        eprintln!("fusor_display: fatal: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_gauge_renders_sentinels_and_values() {
        use fusor_daq::record::{ERROR_NO_VALUE, ERROR_OVER_PRESSURE, ERROR_PRESSURE_SENSOR_FAULTY};

        assert_eq!(format_gauge(12.5), "12.500");
        assert_eq!(format_gauge(ERROR_PRESSURE_SENSOR_FAULTY), "FAULTY");
        assert_eq!(format_gauge(ERROR_OVER_PRESSURE), "OVPRES");
        assert_eq!(format_gauge(ERROR_NO_VALUE), "NOVAL");
    }

    #[test]
    fn format_local_time_is_stable_for_the_same_instant() {
        let first = format_local_time(1_700_000_000);
        let second = format_local_time(1_700_000_000);
        assert_eq!(first, second);
        assert!(first.starts_with("2023"));
    }

    #[test]
    fn format_local_time_reports_invalid_instants_instead_of_panicking() {
        assert!(format_local_time(i64::MAX).starts_with("<invalid:"));
    }

    #[test]
    fn parse_line_recognizes_plain_and_modified_keys() {
        assert_eq!(parse_line("esc"), Some((Key::Esc, Modifiers::default())));
        assert_eq!(
            parse_line("C-p"),
            Some((Key::Screenshot, Modifiers { ctrl: true, alt: false }))
        );
        assert_eq!(parse_line("unknown"), None);
    }
}
