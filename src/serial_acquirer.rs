//! SerialAcquirer: lifecycle, binary frame decode, and health-monitor
//! for the low-speed multi-channel serial ADC, per spec.md §4.4.
//!
//! Grounded on `original_source/util_dataq.c`: `dataq_init`'s drain/
//! INFO/SLIST/SRATE/BIN/START command sequence, `dataq_issue_cmd`'s
//! echo-matching protocol, `dataq_recv_data_thread`'s sync-bit check
//! and raw-to-millivolt decode (now delegated to
//! [`crate::sample_ring::code_to_mv`]), and `dataq_monitor_thread`'s
//! ±10% scan-rate window. The serial-port tty configuration itself
//! (`stty`, line discipline) is the out-of-scope collaborator (spec.md
//! §1); this module depends on the `serialport` crate for the raw byte
//! channel only, matching how the donor's `adapters/serial_adapter.rs`
//! treats `serialport::new(..).open()` as the external boundary.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::error::{DaqError, DaqResult};
use crate::sample_ring::{code_to_mv, SampleRing};

/// Highest valid 1-based ADC channel number (`util_dataq.c`: `MAX_ADC_CHAN`).
pub const MAX_ADC_CHAN: u8 = 9;

/// A byte-stream collaborator standing in for the configured tty. Real
/// usage is a `serialport::SerialPort` (feature `hardware_serial`);
/// tests use an in-memory loopback pair.
pub trait SerialChannel: Read + Write + Send {}
impl<T: Read + Write + Send> SerialChannel for T {}

#[cfg(feature = "hardware_serial")]
/// Opens the real tty, per the donor's `serialport::new(..).open()`
/// pattern (`examples/easternanemone-rust-daq/src/adapters/serial_adapter.rs`).
pub fn open_hardware_port(device_path: &str) -> DaqResult<Box<dyn SerialChannel>> {
    let port = serialport::new(device_path, 115_200)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| DaqError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(Box::new(port))
}

/// Issues `cmd` terminated with `\r` and reads back an echo terminated
/// with `\r`, verifying the echo starts with `cmd`, within a 1 s
/// timeout. Mirrors `dataq_issue_cmd`.
fn issue_cmd(channel: &mut dyn SerialChannel, cmd: &str) -> DaqResult<String> {
    let mut line = String::from(cmd);
    line.push('\r');
    channel.write_all(line.as_bytes())?;

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut resp = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if Instant::now() >= deadline {
            return Err(DaqError::SerialInitTimeout(cmd.to_string()));
        }
        match channel.read(&mut byte) {
            Ok(1) => {
                if byte[0] == b'\r' {
                    break;
                }
                resp.push(byte[0]);
            }
            Ok(_) => std::thread::sleep(Duration::from_millis(5)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(DaqError::Io(e)),
        }
    }
    let resp = String::from_utf8_lossy(&resp).to_string();
    if !resp.starts_with(cmd) {
        return Err(DaqError::SerialCommandNotAcked(cmd.to_string()));
    }
    Ok(resp)
}

/// Drains any prior scanning session by issuing STOP until its echo is
/// observed, per `dataq_init`'s pre-init drain, 1 s timeout.
fn drain_prior_session(channel: &mut dyn SerialChannel) -> DaqResult<()> {
    channel.write_all(b"stop\r")?;
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut tail = [0u8; 5];
    let mut filled = 0usize;
    let mut byte = [0u8; 1];
    loop {
        if Instant::now() >= deadline {
            return Err(DaqError::SerialInitTimeout("stop".to_string()));
        }
        match channel.read(&mut byte) {
            Ok(1) => {
                if filled < tail.len() {
                    tail[filled] = byte[0];
                    filled += 1;
                } else {
                    tail.copy_within(1.., 0);
                    tail[tail.len() - 1] = byte[0];
                }
                if filled >= 5 && &tail == b"stop\r" {
                    return Ok(());
                }
            }
            Ok(_) => std::thread::sleep(Duration::from_millis(100)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(DaqError::Io(e)),
        }
    }
}

/// Decodes one raw 12-bit signed sample from its two little-endian
/// wire bytes, per spec.md §4.4's decode formula.
pub fn decode_sample(b0: u8, b1: u8) -> i32 {
    let mut raw = (((b1 & 0xFE) as i32) << 4) | ((b0 >> 3) as i32);
    raw ^= 0x800;
    if raw & 0x800 != 0 {
        raw |= -4096i32; // 0xFFFFF000 as i32
    }
    raw
}

/// One 1-based ADC channel bound into the scanlist, in slot order.
#[derive(Debug, Clone, Copy)]
pub struct ScanlistEntry {
    /// 1-based channel number, as written into `SLIST`.
    pub adc_chan: u8,
}

/// Owns the serial device lifecycle, frame decode, and per-channel
/// [`SampleRing`]s.
pub struct SerialAcquirer {
    rings: Arc<Mutex<HashMap<u8, SampleRing>>>,
    scan_okay: Arc<AtomicBool>,
    scan_count: Arc<AtomicI64>,
    running: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl SerialAcquirer {
    /// Creates an acquirer with one empty [`SampleRing`] per scanlist
    /// entry, windowed to `scan_hz * averaging_duration_sec` samples.
    pub fn new(scanlist: &[ScanlistEntry], scan_hz: u32, averaging_duration_sec: u32) -> Self {
        let window = (scan_hz * averaging_duration_sec) as usize;
        let mut rings = HashMap::new();
        for entry in scanlist {
            rings.insert(entry.adc_chan, SampleRing::new(window.max(1)));
        }
        SerialAcquirer {
            rings: Arc::new(Mutex::new(rings)),
            scan_okay: Arc::new(AtomicBool::new(false)),
            scan_count: Arc::new(AtomicI64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            reader_handle: None,
            monitor_handle: None,
        }
    }

    /// Whether the monitor thread currently considers the scan rate
    /// healthy (within ±10% of the configured `scan_hz`).
    pub fn scan_okay(&self) -> bool {
        self.scan_okay.load(Ordering::Acquire)
    }

    /// Runs the full init sequence (drain, INFO, SLIST, SRATE, BIN,
    /// START) against `channel`, then spawns the reader and monitor
    /// threads. Fatal on any step's failure, per spec.md §7.
    pub fn start(
        &mut self,
        mut channel: Box<dyn SerialChannel>,
        scanlist: &[ScanlistEntry],
        scan_hz: u32,
    ) -> DaqResult<()> {
        for entry in scanlist {
            if entry.adc_chan == 0 || entry.adc_chan >= MAX_ADC_CHAN {
                return Err(DaqError::InvalidConfig(format!(
                    "adc_chan {} out of range",
                    entry.adc_chan
                )));
            }
        }
        let best_scan_hz = 10_000 / scanlist.len().max(1) as u32;
        if scan_hz > best_scan_hz {
            return Err(DaqError::InvalidConfig(format!(
                "scan_hz {scan_hz} exceeds best achievable {best_scan_hz}"
            )));
        }

        drain_prior_session(channel.as_mut())?;
        issue_cmd(channel.as_mut(), "info 0")?;
        issue_cmd(channel.as_mut(), "asc")?;
        for (idx, entry) in scanlist.iter().enumerate() {
            issue_cmd(
                channel.as_mut(),
                &format!("slist {idx} x{:04x}", entry.adc_chan - 1),
            )?;
        }
        issue_cmd(channel.as_mut(), &format!("srate x{:04x}", 750_000 / scan_hz))?;
        issue_cmd(channel.as_mut(), "bin")?;
        // The device echoes "start\r" back before it begins streaming
        // binary frames; `reader_loop` would otherwise read that ASCII
        // echo as its first frame and immediately fail the sync check.
        issue_cmd(channel.as_mut(), "start")?;

        info!(scan_hz, channels = scanlist.len(), "SerialAcquirer starting");
        self.running.store(true, Ordering::Release);

        let slots: Vec<u8> = scanlist.iter().map(|e| e.adc_chan).collect();
        let frame_len = slots.len() * 2;

        let reader_channel: Arc<Mutex<Box<dyn SerialChannel>>> = Arc::new(Mutex::new(channel));
        let reader_rings = Arc::clone(&self.rings);
        let reader_scan_count = Arc::clone(&self.scan_count);
        let reader_running = Arc::clone(&self.running);
        let reader_slots = slots.clone();
        self.reader_handle = Some(std::thread::spawn(move || {
            Self::reader_loop(
                reader_channel,
                reader_rings,
                reader_scan_count,
                reader_running,
                reader_slots,
                frame_len,
            );
        }));

        let monitor_scan_count = Arc::clone(&self.scan_count);
        let monitor_scan_okay = Arc::clone(&self.scan_okay);
        let monitor_running = Arc::clone(&self.running);
        self.monitor_handle = Some(std::thread::spawn(move || {
            Self::monitor_loop(monitor_scan_count, monitor_scan_okay, monitor_running, scan_hz);
        }));

        Ok(())
    }

    fn reader_loop(
        channel: Arc<Mutex<Box<dyn SerialChannel>>>,
        rings: Arc<Mutex<HashMap<u8, SampleRing>>>,
        scan_count: Arc<AtomicI64>,
        running: Arc<AtomicBool>,
        slots: Vec<u8>,
        frame_len: usize,
    ) {
        let mut buf: Vec<u8> = Vec::with_capacity(1000);
        let mut scratch = [0u8; 1000];
        while running.load(Ordering::Acquire) {
            let n = {
                let mut ch = channel.lock().expect("serial channel mutex poisoned");
                match ch.read(&mut scratch) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                    Err(e) => {
                        error!(error = %e, "serial ADC read failed");
                        return;
                    }
                }
            };
            if n == 0 {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            buf.extend_from_slice(&scratch[..n]);

            while buf.len() >= frame_len + 1 {
                if (buf[0] & 1) != 0 || (buf[frame_len] & 1) != 0 {
                    error!("serial ADC lost frame sync");
                    return;
                }
                let mut rings = rings.lock().expect("rings mutex poisoned");
                for (slot_idx, &adc_chan) in slots.iter().enumerate() {
                    let b0 = buf[slot_idx * 2];
                    let b1 = buf[slot_idx * 2 + 1];
                    let raw = decode_sample(b0, b1);
                    let mv = code_to_mv(raw) as i16;
                    if let Some(ring) = rings.get_mut(&adc_chan) {
                        ring.push(mv);
                    }
                }
                drop(rings);
                buf.drain(0..frame_len);
                scan_count.fetch_add(1, Ordering::Release);
            }
        }
    }

    fn monitor_loop(
        scan_count: Arc<AtomicI64>,
        scan_okay: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        scan_hz: u32,
    ) {
        let min_scan_hz = scan_hz as i64 - scan_hz as i64 / 10;
        let max_scan_hz = scan_hz as i64 + scan_hz as i64 / 10;
        let mut last = scan_count.load(Ordering::Acquire);
        while running.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_secs(1));
            if !running.load(Ordering::Acquire) {
                break;
            }
            let current = scan_count.load(Ordering::Acquire);
            let delta = current - last;
            last = current;
            let okay = delta > min_scan_hz && delta < max_scan_hz;
            let was_okay = scan_okay.swap(okay, Ordering::AcqRel);
            if okay && !was_okay {
                info!(delta, "serial ADC scan okay");
            } else if !okay && was_okay {
                warn!(delta, min_scan_hz, max_scan_hz, "serial ADC scan rate deviation");
            }
        }
    }

    /// Marks every ring's `scan_okay` to match the monitor thread's
    /// current verdict; called by readers before trusting stats.
    pub fn sync_ring_scan_okay(&self) {
        let okay = self.scan_okay();
        let mut rings = self.rings.lock().expect("rings mutex poisoned");
        for ring in rings.values_mut() {
            ring.set_scan_okay(okay);
        }
    }

    /// Shared handle to the per-channel rings, for the Fuser to read
    /// stats/tail from.
    pub fn rings(&self) -> Arc<Mutex<HashMap<u8, SampleRing>>> {
        Arc::clone(&self.rings)
    }

    /// Stops the reader/monitor threads, per the 5 s join budget of
    /// spec.md §5.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(h) = self.reader_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.monitor_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for SerialAcquirer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn decode_sample_matches_spec_formula() {
        // raw 12-bit value 0x123 placed into the slot per the encode rule.
        let raw = 0x123i32;
        let b0 = ((raw << 3) & 0xff) as u8;
        let b1 = ((raw >> 4) & 0xfe) as u8;
        let decoded = decode_sample(b0, b1);
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decode_sample_sign_extends_negative() {
        // A raw value that, after the xor-with-0x800 step, has bit 0x800
        // set should sign-extend to a negative i32.
        let raw = -100i32 & 0xfff;
        let b0 = ((raw << 3) & 0xff) as u8;
        let b1 = ((raw >> 4) & 0xfe) as u8;
        let decoded = decode_sample(b0, b1);
        assert_eq!(decoded, -100);
    }

    #[test]
    fn issue_cmd_matches_echo() {
        let mut channel = Cursor::new(b"info 0\r".to_vec());
        let resp = issue_cmd(&mut channel, "info 0").unwrap();
        assert_eq!(resp, "info 0");
    }

    #[test]
    fn issue_cmd_rejects_mismatched_echo() {
        let mut channel = Cursor::new(b"garbage\r".to_vec());
        let err = issue_cmd(&mut channel, "info 0").unwrap_err();
        assert!(matches!(err, DaqError::SerialCommandNotAcked(_)));
    }

    #[test]
    fn start_rejects_mismatched_start_echo_before_spawning_reader() {
        let scanlist = [ScanlistEntry { adc_chan: 1 }];
        let mut acquirer = SerialAcquirer::new(&scanlist, 100, 1);
        let responses = b"stop\rinfo 0\rasc\rslist 0 x0000\rsrate x1d4c\rbin\rnope\r".to_vec();
        let channel: Box<dyn SerialChannel> = Box::new(Cursor::new(responses));

        let err = acquirer.start(channel, &scanlist, 100).unwrap_err();
        assert!(matches!(err, DaqError::SerialCommandNotAcked(cmd) if cmd == "start"));
        assert!(!acquirer.scan_okay());
    }

    #[test]
    fn new_acquirer_creates_one_ring_per_scanlist_entry() {
        let scanlist = [
            ScanlistEntry { adc_chan: 1 },
            ScanlistEntry { adc_chan: 2 },
            ScanlistEntry { adc_chan: 3 },
        ];
        let acquirer = SerialAcquirer::new(&scanlist, 100, 1);
        assert_eq!(acquirer.rings().lock().unwrap().len(), 3);
        assert!(!acquirer.scan_okay());
    }
}
