//! Typed settings, loaded from a TOML file via the `config` crate and
//! validated before use.
//!
//! Mirrors the donor's `Settings`/`TimeoutSettings::validate()` shape:
//! a nested settings struct with serde defaults for optional fields,
//! plus a `validate()` pass that range-checks values and reports every
//! problem it finds rather than failing on the first one.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Serial-ADC (DATAQ-style) acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// tty device path, e.g. `/dev/serial/by-id/usb-0683_1490-if00`.
    pub device_path: String,
    /// ADC channels to enable, 1-based, matching `common.h`'s
    /// `ADC_CHAN_*` numbering (1=voltage, 2=current, 3=pressure).
    pub channels: Vec<u8>,
    /// Requested scan rate in Hz, must not exceed `10000 / channels.len()`.
    pub scan_hz: u32,
    /// Averaging window, seconds; `scan_hz * averaging_duration_sec`
    /// must not exceed `MAX_VAL` (10,000).
    pub averaging_duration_sec: u32,
}

/// Fast-ADC (USB bulk) acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastAdcSettings {
    /// Use the real USB device path. When `false`, `SimulatedFastAdc`
    /// is used instead (also the only option when the crate is built
    /// without a real USB binding).
    #[serde(default)]
    pub use_hardware: bool,
    /// Target sample rate, samples/sec. ~500kSa/s nominal.
    #[serde(default = "default_fast_adc_hz")]
    pub sample_rate_hz: u32,
}

fn default_fast_adc_hz() -> u32 {
    499_999
}

impl Default for FastAdcSettings {
    fn default() -> Self {
        Self {
            use_hardware: false,
            sample_rate_hz: default_fast_adc_hz(),
        }
    }
}

/// Camera acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Whether the camera acquirer runs at all (`-x` disables it).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// V4L2-style device path.
    #[serde(default = "default_camera_device")]
    pub device_path: String,
}

fn default_true() -> bool {
    true
}

fn default_camera_device() -> String {
    "/dev/video0".to_string()
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            device_path: default_camera_device(),
        }
    }
}

/// Log file / LogStore settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory new log files are created in (LIVE mode with no
    /// explicit output filename is not supported; spec.md requires a
    /// positional filename argument for LIVE mode).
    #[serde(default = "default_storage_dir")]
    pub default_dir: PathBuf,
    /// Maximum number of Part1 slots (`MAX_FILE_DATA_PART1`).
    #[serde(default = "default_max_file_data_part1")]
    pub max_records: u32,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_file_data_part1() -> u32 {
    // One record per second; default capacity covers a little over 30 days.
    3_000_000
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            default_dir: default_storage_dir(),
            max_records: default_max_file_data_part1(),
        }
    }
}

/// Networking (TCP) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Host:port the server listens on.
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    /// Host:port clients connect to.
    #[serde(default = "default_listen")]
    pub server_addr: String,
    /// Client receive timeout, seconds, before treating the
    /// connection as lost (spec.md §4.8: 5s).
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
    /// Maximum allowed wall-clock drift between server and client,
    /// seconds, before entering the terminal Time-Error state.
    #[serde(default = "default_max_drift_secs")]
    pub max_time_drift_secs: i64,
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", crate::record::SERVER_PORT)
}

fn default_recv_timeout_secs() -> u64 {
    5
}

fn default_max_drift_secs() -> i64 {
    5
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            server_addr: default_listen(),
            recv_timeout_secs: default_recv_timeout_secs(),
            max_time_drift_secs: default_max_drift_secs(),
        }
    }
}

/// CPM moving-average window sizes, seconds. Defaulted to the spec's
/// `{1, 10, 60, 600, 3600}` but overridable so tests can use compressed
/// windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpmSettings {
    /// Window sizes, in ascending order.
    #[serde(default = "default_cpm_windows")]
    pub windows_sec: Vec<u32>,
}

fn default_cpm_windows() -> Vec<u32> {
    vec![1, 10, 60, 600, 3600]
}

impl Default for CpmSettings {
    fn default() -> Self {
        Self {
            windows_sec: default_cpm_windows(),
        }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// `RUST_LOG`-style default level used when the env var is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Serial-ADC configuration.
    pub serial: SerialSettings,
    /// Fast-ADC configuration.
    #[serde(default)]
    pub fast_adc: FastAdcSettings,
    /// Camera configuration.
    #[serde(default)]
    pub camera: CameraSettings,
    /// LogStore configuration.
    #[serde(default)]
    pub storage: StorageSettings,
    /// TCP networking configuration.
    #[serde(default)]
    pub network: NetworkSettings,
    /// CPM window configuration.
    #[serde(default)]
    pub cpm: CpmSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        let settings: Settings = builder.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Range-check every field that has a meaningful range, collecting
    /// every violation into a single error rather than stopping at the
    /// first one.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.serial.channels.is_empty() {
            problems.push("serial.channels must not be empty".to_string());
        }
        for &ch in &self.serial.channels {
            if ch == 0 || ch > 8 {
                problems.push(format!("serial.channels entry {ch} out of range [1,8]"));
            }
        }
        let max_slist_idx = self.serial.channels.len() as u32;
        if max_slist_idx > 0 {
            let best_scan_hz = 10_000 / max_slist_idx;
            if self.serial.scan_hz > best_scan_hz {
                problems.push(format!(
                    "serial.scan_hz {} exceeds best achievable {best_scan_hz} for {max_slist_idx} channels",
                    self.serial.scan_hz
                ));
            }
        }
        if self.serial.scan_hz == 0 {
            problems.push("serial.scan_hz must be nonzero".to_string());
        }
        let max_averaging_val = self.serial.scan_hz as u64 * self.serial.averaging_duration_sec as u64;
        if max_averaging_val > crate::sample_ring::MAX_VAL as u64 {
            problems.push(format!(
                "serial.scan_hz * serial.averaging_duration_sec = {max_averaging_val} exceeds MAX_VAL ({})",
                crate::sample_ring::MAX_VAL
            ));
        }

        if self.fast_adc.sample_rate_hz == 0 {
            problems.push("fast_adc.sample_rate_hz must be nonzero".to_string());
        }

        if self.network.recv_timeout_secs == 0 {
            problems.push("network.recv_timeout_secs must be nonzero".to_string());
        }
        if self.network.max_time_drift_secs <= 0 {
            problems.push("network.max_time_drift_secs must be positive".to_string());
        }

        if self.storage.max_records == 0 {
            problems.push("storage.max_records must be nonzero".to_string());
        }

        if self.cpm.windows_sec.is_empty() {
            problems.push("cpm.windows_sec must not be empty".to_string());
        }
        if self.cpm.windows_sec.iter().any(|&w| w == 0) {
            problems.push("cpm.windows_sec entries must be nonzero".to_string());
        }

        if !problems.is_empty() {
            bail!("invalid configuration:\n  {}", problems.join("\n  "));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            serial: SerialSettings {
                device_path: "/dev/serial/by-id/usb-0683_1490-if00".to_string(),
                channels: vec![1, 2, 3],
                scan_hz: 100,
                averaging_duration_sec: 1,
            },
            fast_adc: FastAdcSettings::default(),
            camera: CameraSettings::default(),
            storage: StorageSettings::default(),
            network: NetworkSettings::default(),
            cpm: CpmSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn scan_hz_over_best_achievable_fails() {
        let mut settings = Settings::default();
        settings.serial.channels = vec![1, 2, 3, 4, 5, 6, 7, 8];
        settings.serial.scan_hz = 5000; // best achievable is 10000/8=1250
        assert!(settings.validate().is_err());
    }

    #[test]
    fn averaging_window_over_max_val_fails() {
        let mut settings = Settings::default();
        settings.serial.channels = vec![1];
        settings.serial.scan_hz = 9000;
        settings.serial.averaging_duration_sec = 2; // 18000 > MAX_VAL
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_channels_fails() {
        let mut settings = Settings::default();
        settings.serial.channels.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_from_toml_roundtrips() {
        let toml_src = r#"
            [serial]
            device_path = "/dev/ttyUSB0"
            channels = [1, 2, 3]
            scan_hz = 100
            averaging_duration_sec = 1
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, toml_src).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.serial.device_path, "/dev/ttyUSB0");
        assert_eq!(settings.network.recv_timeout_secs, 5);
    }
}
