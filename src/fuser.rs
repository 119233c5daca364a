//! Fuser: one-second-cadence assembly of Part1/Part2 from the three
//! acquirers, network fan-out, and handoff to Recorder, per spec.md
//! §4.6.
//!
//! Grounded on `original_source/get_data.c`'s `server_thread` (cadence
//! driven by the camera grab, `time_now == time_last` discard,
//! `time_now != time_last+1` gap warning) and `init_data_struct`
//! (Part1/Part2 assembly, voltage/current/pressure conversions).

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::camera_acquirer::STALENESS_US;
use crate::cpm_window::CpmWindows;
use crate::gas_table::{voltage_to_pressure_mtorr, GasId};
use crate::pulse_detector::PulseDetector;
use crate::record::{DiagChannel, GaugeReading, Part1, Part2, Record, MAX_ADC_DIAG_CHAN, MAX_ADC_SAMPLES, MAX_CHANNEL};
use crate::sample_ring::SampleRing;

/// HV divider scale: 1 GΩ / 94.34 kΩ, per spec.md §4.6 (the 94.34 kΩ
/// leg accounts for a parallel 10 MΩ panel meter and 2 MΩ DAQ input
/// loading down an ideal 100 kΩ leg).
pub fn convert_adc_voltage_kv(adc_volts: f32) -> f32 {
    adc_volts * (1.0e9 / 94.34e3 / 1000.0)
}

/// 100 Ω current-shunt scale.
pub fn convert_adc_current_ma(adc_volts: f32) -> f32 {
    adc_volts * 10.0
}

/// One serial channel's contribution to Part1/Part2: stats plus the
/// raw millivolt trace for the diagnostic array.
struct ChannelSnapshot {
    mean_mv: i16,
    min_mv: i16,
    max_mv: i16,
    trace_mv: Vec<i16>,
    valid: bool,
}

fn snapshot_channel(ring: &SampleRing) -> ChannelSnapshot {
    match (ring.stats(), ring.tail(MAX_ADC_SAMPLES)) {
        (Ok(stats), Ok(trace)) => ChannelSnapshot {
            mean_mv: stats.mean.round() as i16,
            min_mv: stats.min,
            max_mv: stats.max,
            trace_mv: trace,
            valid: true,
        },
        _ => ChannelSnapshot {
            mean_mv: 0,
            min_mv: 0,
            max_mv: 0,
            trace_mv: vec![0; MAX_ADC_SAMPLES],
            valid: false,
        },
    }
}

/// Latest latched camera frame: JPEG bytes plus capture timestamp,
/// guarded by a single mutex held only across the memcpy + timestamp
/// update (spec.md §5).
#[derive(Default)]
pub struct JpegLatch {
    inner: Mutex<Option<(Vec<u8>, i64)>>,
}

impl JpegLatch {
    /// Replaces the latched frame.
    pub fn set(&self, jpeg: Vec<u8>, capture_us: i64) {
        *self.inner.lock().expect("jpeg latch mutex poisoned") = Some((jpeg, capture_us));
    }

    /// Returns the latched frame if it is newer than `now_us -
    /// STALENESS_US`, per spec.md §4.5's staleness rule.
    pub fn take_if_fresh(&self, now_us: i64) -> Option<Vec<u8>> {
        let guard = self.inner.lock().expect("jpeg latch mutex poisoned");
        guard.as_ref().and_then(|(jpeg, capture_us)| {
            if now_us - capture_us < STALENESS_US {
                Some(jpeg.clone())
            } else {
                None
            }
        })
    }
}

/// Assembles one-second records from live acquirer state and fans
/// them out to connected clients and the Recorder.
///
/// Both D2 and N2 chamber-pressure readings are always computed (Part1
/// carries both gauges unconditionally, per spec.md §3) — there is no
/// per-process "selected gas" to configure here; that choice lives only
/// in which column a display client chooses to plot.
pub struct Fuser {
    last_time: Option<i64>,
    cpm_windows: CpmWindows,
}

impl Fuser {
    /// Creates a Fuser with no prior second processed yet.
    pub fn new(window_sizes_sec: &[u32]) -> Self {
        Fuser {
            last_time: None,
            cpm_windows: CpmWindows::new(window_sizes_sec),
        }
    }

    /// Runs one iteration: called once per camera grab. Returns
    /// `Some(Record)` when a new second boundary was crossed and a
    /// record assembled; `None` if `now` duplicates the last
    /// processed second (the camera frame is discarded per spec.md
    /// §4.6 step 2).
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        now: i64,
        now_us: i64,
        serial_rings: &Mutex<HashMap<u8, SampleRing>>,
        detector: &Mutex<PulseDetector>,
        jpeg_latch: &JpegLatch,
    ) -> Option<Record> {
        if self.last_time == Some(now) {
            return None;
        }
        if let Some(last) = self.last_time {
            if now != last + 1 {
                warn!(last_time = last, now, "Fuser observed a time gap");
            }
        }
        self.last_time = Some(now);

        let counts = detector.lock().expect("detector mutex poisoned").end_of_second();
        self.cpm_windows.push_second(counts);
        let cpm_snapshots = self.cpm_windows.snapshot_all();
        let mut cpm = [[0.0f32; MAX_CHANNEL]; 5];
        for (w, snap) in cpm_snapshots.iter().enumerate().take(5) {
            cpm[w] = *snap;
        }

        let rings = serial_rings.lock().expect("rings mutex poisoned");
        let voltage = rings.get(&1).map(snapshot_channel);
        let current = rings.get(&2).map(snapshot_channel);
        let pressure = rings.get(&3).map(snapshot_channel);
        drop(rings);

        let (voltage_mean_kv, voltage_min_kv, voltage_max_kv) = match &voltage {
            Some(s) if s.valid => (
                convert_adc_voltage_kv(s.mean_mv as f32 / 1000.0),
                convert_adc_voltage_kv(s.min_mv as f32 / 1000.0),
                convert_adc_voltage_kv(s.max_mv as f32 / 1000.0),
            ),
            _ => (
                GaugeReading::NoValue.to_wire_f32(),
                GaugeReading::NoValue.to_wire_f32(),
                GaugeReading::NoValue.to_wire_f32(),
            ),
        };
        let current_ma = match &current {
            Some(s) if s.valid => convert_adc_current_ma(s.mean_mv as f32 / 1000.0),
            _ => GaugeReading::NoValue.to_wire_f32(),
        };
        let (pressure_d2, pressure_n2) = match &pressure {
            Some(s) if s.valid => {
                // original_source/get_data.c's chamber-pressure conversion
                // (lines 289-328) lives inside a dead `#if 0` block and
                // uses max_mv; original_source/main.c:935-942 is the only
                // active, compiling pressure conversion in the corpus and
                // uses mean_mv. Matching the code path that actually runs.
                let adc_volts = s.mean_mv as f32 / 1000.0;
                (
                    voltage_to_pressure_mtorr(adc_volts, GasId::D2).to_wire_f32(),
                    voltage_to_pressure_mtorr(adc_volts, GasId::N2).to_wire_f32(),
                )
            }
            _ => (
                GaugeReading::NoValue.to_wire_f32(),
                GaugeReading::NoValue.to_wire_f32(),
            ),
        };
        let mut channel_valid = [0u32; MAX_ADC_DIAG_CHAN];
        channel_valid[DiagChannel::Voltage as usize] = voltage.as_ref().map_or(0, |s| s.valid as u32);
        channel_valid[DiagChannel::Current as usize] = current.as_ref().map_or(0, |s| s.valid as u32);
        channel_valid[DiagChannel::Pressure as usize] = pressure.as_ref().map_or(0, |s| s.valid as u32);
        channel_valid[DiagChannel::He3 as usize] = 1;

        let mut part2 = Part2::empty();
        if let Some(s) = &voltage {
            copy_trace(&mut part2.traces[DiagChannel::Voltage as usize], &s.trace_mv);
        }
        if let Some(s) = &current {
            copy_trace(&mut part2.traces[DiagChannel::Current as usize], &s.trace_mv);
        }
        if let Some(s) = &pressure {
            copy_trace(&mut part2.traces[DiagChannel::Pressure as usize], &s.trace_mv);
        }

        let jpeg_valid;
        if let Some(jpeg) = jpeg_latch.take_if_fresh(now_us) {
            part2.jpeg = jpeg;
            jpeg_valid = 1;
        } else {
            jpeg_valid = 0;
        }

        let part1 = Part1 {
            magic: crate::record::MAGIC_DATA_PART1,
            time: now,
            voltage_mean_kv,
            voltage_min_kv,
            voltage_max_kv,
            current_ma,
            pressure_d2_mtorr: pressure_d2,
            pressure_n2_mtorr: pressure_n2,
            cpm,
            data_part2_offset: 0,
            data_part2_length: part2.encoded_len() as u32,
            channel_valid,
            jpeg_valid,
        };

        Some(Record { part1, part2 })
    }
}

fn copy_trace(dest: &mut [i16; MAX_ADC_SAMPLES], src: &[i16]) {
    let n = src.len().min(MAX_ADC_SAMPLES);
    dest[..n].copy_from_slice(&src[..n]);
}

/// Sends `record` to every connected client, per spec.md §4.6's
/// network-framing rule (Part1 then Part2, back-to-back).
pub fn fan_out(record: &Record, clients: &[Arc<Mutex<TcpStream>>]) {
    use std::io::Write;
    let part1_bytes = record.part1.encode();
    let part2_bytes = record.part2.encode();
    for client in clients {
        let mut stream = client.lock().expect("client stream mutex poisoned");
        if stream.write_all(&part1_bytes).is_err() {
            continue;
        }
        let _ = stream.write_all(&part2_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_adc_voltage_matches_scale() {
        let kv = convert_adc_voltage_kv(1.0);
        assert!((kv - (1.0e9 / 94.34e3 / 1000.0)).abs() < 1e-6);
    }

    #[test]
    fn tick_discards_duplicate_second() {
        let mut fuser = Fuser::new(&[1, 10]);
        let rings = Mutex::new(HashMap::new());
        let detector = Mutex::new(PulseDetector::new());
        let latch = JpegLatch::default();
        let first = fuser.tick(100, 100_000_000, &rings, &detector, &latch);
        assert!(first.is_some());
        let second = fuser.tick(100, 100_500_000, &rings, &detector, &latch);
        assert!(second.is_none());
    }

    #[test]
    fn tick_warns_but_proceeds_on_gap() {
        let mut fuser = Fuser::new(&[1]);
        let rings = Mutex::new(HashMap::new());
        let detector = Mutex::new(PulseDetector::new());
        let latch = JpegLatch::default();
        fuser.tick(100, 100_000_000, &rings, &detector, &latch);
        let record = fuser.tick(105, 105_000_000, &rings, &detector, &latch);
        assert!(record.is_some());
        assert_eq!(record.unwrap().part1.time, 105);
    }

    #[test]
    fn tick_marks_channels_invalid_without_scan_okay() {
        let mut fuser = Fuser::new(&[1]);
        let mut map = HashMap::new();
        map.insert(1u8, SampleRing::new(10));
        let rings = Mutex::new(map);
        let detector = Mutex::new(PulseDetector::new());
        let latch = JpegLatch::default();
        let record = fuser.tick(100, 100_000_000, &rings, &detector, &latch).unwrap();
        assert_eq!(record.part1.channel_valid[DiagChannel::Voltage as usize], 0);
        assert_eq!(
            GaugeReading::from_wire_f32(record.part1.voltage_mean_kv),
            GaugeReading::NoValue
        );
    }

    #[test]
    fn jpeg_latch_honors_staleness_window() {
        let latch = JpegLatch::default();
        latch.set(vec![1, 2, 3], 0);
        assert!(latch.take_if_fresh(500_000).is_some());
        assert!(latch.take_if_fresh(1_500_000).is_none());
    }
}
