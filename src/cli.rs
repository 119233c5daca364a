//! `clap`-derived CLI for the display client binary, per spec.md §6.3.

use std::path::PathBuf;

use clap::Parser;

/// Window geometry, parsed from `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Width, pixels.
    pub width: u32,
    /// Height, pixels.
    pub height: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            width: 1920,
            height: 1000,
        }
    }
}

impl std::str::FromStr for Geometry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .or_else(|| s.split_once('X'))
            .ok_or_else(|| format!("geometry `{s}` is not in WxH form"))?;
        let width: u32 = w
            .parse()
            .map_err(|_| format!("geometry `{s}` has a non-numeric width"))?;
        let height: u32 = h
            .parse()
            .map_err(|_| format!("geometry `{s}` has a non-numeric height"))?;
        Ok(Geometry { width, height })
    }
}

/// `fusor_display` command line, per spec.md §6.3.
#[derive(Debug, Parser)]
#[command(name = "fusor_display", version, about = "Live/playback display client for the fusor telemetry engine")]
pub struct Cli {
    /// Window geometry, `WxH` (default 1920x1000).
    #[arg(short = 'g', long = "geometry", default_value = "1920x1000")]
    pub geometry: Geometry,

    /// Server host (or host:port) to connect to in LIVE mode.
    #[arg(short = 's', long = "server")]
    pub server: Option<String>,

    /// Playback mode: read an existing log file instead of connecting live.
    #[arg(short = 'p', long = "playback")]
    pub playback: Option<PathBuf>,

    /// Disable this client's local camera splice.
    #[arg(short = 'x', long = "no-camera")]
    pub no_camera: bool,

    /// Generate a synthetic test file of the given duration, seconds,
    /// instead of running the display.
    #[arg(short = 't', long = "test-file-secs")]
    pub test_file_secs: Option<u64>,

    /// Output filename for LIVE mode (the file LIVE records are
    /// mirrored into locally).
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Whether this invocation is LIVE (connects to a server) rather
    /// than pure PLAYBACK.
    pub fn is_live(&self) -> bool {
        self.playback.is_none()
    }
}
