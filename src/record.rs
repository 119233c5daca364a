//! Record types: the one-second Part1/Part2 unit shared by the wire
//! protocol and the log file, plus the sentinel-value gauge readings
//! that round-trip through the reserved `ERROR_*` numeric range.
//!
//! Layout transcribed from `original_source/common.h`'s `data_t` and
//! spec.md §6.1/§6.2, widened to 64-bit magics (see SPEC_FULL.md §3).

use crate::error::{DaqError, DaqResult};

/// TCP port the server listens on (`original_source/common.h`: `PORT`).
pub const SERVER_PORT: u16 = 9001;

/// Number of pulse-height counting channels.
///
/// spec.md's own worked example (§8 scenario 1: `channel = 24 /
/// ((4096-2056)/8) = 0`) fixes this at 8, which disagrees with
/// `original_source/common.h`'s `MAX_DETECTOR_CHAN = 4` — where the
/// spec gives a concrete scenario it is authoritative over the
/// supplementary C header, so this crate uses 8.
pub const MAX_CHANNEL: usize = 8;

/// Number of raw ADC diagnostic trace channels copied into Part2
/// (`MAX_ADC_DIAG_CHAN`): 0=he3, 1=voltage, 2=current, 3=pressure.
pub const MAX_ADC_DIAG_CHAN: usize = 4;

/// Samples per diagnostic trace (`MAX_ADC_DIAG_VALUE` / `MAX_ADC_SAMPLES`).
pub const MAX_ADC_SAMPLES: usize = 1000;

/// CPM moving-average window sizes, seconds, in the fixed order the
/// wire/file format stores them.
pub const CPM_WINDOWS_SEC: [u32; 5] = [1, 10, 60, 600, 3600];

/// Reserved sentinel values, carried forward from `common.h`.
pub const ERROR_PRESSURE_SENSOR_FAULTY: f32 = 1_000_000.0;
/// See [`ERROR_PRESSURE_SENSOR_FAULTY`].
pub const ERROR_OVER_PRESSURE: f32 = 1_000_001.0;
/// See [`ERROR_PRESSURE_SENSOR_FAULTY`].
pub const ERROR_NO_VALUE: f32 = 1_000_002.0;

/// Part1 magic, widened to 64 bits from the original 32-bit
/// `DATA_MAGIC = 0xaabbccdd` (see SPEC_FULL.md §3).
pub const MAGIC_DATA_PART1: u64 = 0xaabb_ccdd_5041_5231;
/// Part2 magic.
pub const MAGIC_DATA_PART2: u64 = 0xaabb_ccdd_5041_5232;

/// A diagnostic trace channel index into Part2's trace arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum DiagChannel {
    /// Fast-ADC (he3 neutron pickoff) raw trace, for diagnostic display.
    He3 = 0,
    /// Serial ADC channel 1.
    Voltage = 1,
    /// Serial ADC channel 2.
    Current = 2,
    /// Serial ADC channel 3.
    Pressure = 3,
}

/// A gauge reading that may be a real value or one of the three
/// reserved sentinels. See spec.md §9 "Sentinel-in-float error codes".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GaugeReading {
    /// An ordinary measurement.
    Value(f32),
    /// The sensor reads below the range the conversion trusts as real.
    Faulty,
    /// The sensor reads beyond the calibrated table's range.
    OverPressure,
    /// No measurement was available for this slot (gap-fill sentinel).
    NoValue,
}

impl GaugeReading {
    /// Whether this is a real value rather than a sentinel.
    pub fn is_value(&self) -> bool {
        matches!(self, GaugeReading::Value(_))
    }

    /// Encodes to the wire/file f32 representation: sentinels become
    /// the matching reserved constant, values pass through unchanged.
    pub fn to_wire_f32(self) -> f32 {
        match self {
            GaugeReading::Value(v) => v,
            GaugeReading::Faulty => ERROR_PRESSURE_SENSOR_FAULTY,
            GaugeReading::OverPressure => ERROR_OVER_PRESSURE,
            GaugeReading::NoValue => ERROR_NO_VALUE,
        }
    }

    /// Decodes from the wire/file f32 representation.
    pub fn from_wire_f32(raw: f32) -> GaugeReading {
        if raw == ERROR_PRESSURE_SENSOR_FAULTY {
            GaugeReading::Faulty
        } else if raw == ERROR_OVER_PRESSURE {
            GaugeReading::OverPressure
        } else if raw == ERROR_NO_VALUE {
            GaugeReading::NoValue
        } else {
            GaugeReading::Value(raw)
        }
    }
}

/// The fixed-size half of a one-second record. Directly memory-mapped
/// by [`crate::log_store::LogStore`] and, bytewise, the first thing
/// sent over the wire each second.
///
/// `#[repr(C)]`, not `packed`: every field is already naturally
/// aligned at its offset (each `u64`/`i64` lands on an 8-byte
/// boundary), so this layout is both a valid direct-mmap view and a
/// stable wire format on any little-endian target.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Part1 {
    /// [`MAGIC_DATA_PART1`].
    pub magic: u64,
    /// Epoch seconds.
    pub time: i64,
    /// Mean HV divider reading over the second, kV (sentinel-capable).
    pub voltage_mean_kv: f32,
    /// Min HV divider reading, kV.
    pub voltage_min_kv: f32,
    /// Max HV divider reading, kV.
    pub voltage_max_kv: f32,
    /// Mean current-shunt reading, mA.
    pub current_ma: f32,
    /// Chamber pressure assuming D2 fill, mTorr.
    pub pressure_d2_mtorr: f32,
    /// Chamber pressure assuming N2 fill, mTorr.
    pub pressure_n2_mtorr: f32,
    /// `cpm[w][c]`: moving average counts/sec for window `w` (order
    /// [`CPM_WINDOWS_SEC`]), channel `c`.
    pub cpm: [[f32; MAX_CHANNEL]; 5],
    /// Byte offset into the Part2 region/wire stream.
    pub data_part2_offset: u64,
    /// Byte length of the following Part2 payload.
    pub data_part2_length: u32,
    /// Per-channel trace validity (1 = valid), order [`DiagChannel`].
    pub channel_valid: [u32; MAX_ADC_DIAG_CHAN],
    /// Whether Part2 carries a JPEG frame.
    pub jpeg_valid: u32,
}

/// Wire/file size of [`Part1`] in bytes (232, with `MAX_CHANNEL = 8`).
pub const PART1_SIZE: usize = std::mem::size_of::<Part1>();
const _: () = assert!(PART1_SIZE == 232);

impl Part1 {
    /// A record with every gauge at [`GaugeReading::NoValue`] and
    /// empty CPM windows, used by Recorder's gap-fill policy.
    pub fn no_value(time: i64) -> Self {
        Part1 {
            magic: MAGIC_DATA_PART1,
            time,
            voltage_mean_kv: ERROR_NO_VALUE,
            voltage_min_kv: ERROR_NO_VALUE,
            voltage_max_kv: ERROR_NO_VALUE,
            current_ma: ERROR_NO_VALUE,
            pressure_d2_mtorr: ERROR_NO_VALUE,
            pressure_n2_mtorr: ERROR_NO_VALUE,
            cpm: [[0.0; MAX_CHANNEL]; 5],
            data_part2_offset: 0,
            data_part2_length: (Part2::HEADER_AND_TRACE_SIZE) as u32,
            channel_valid: [0; MAX_ADC_DIAG_CHAN],
            jpeg_valid: 0,
        }
    }

    /// Serializes to little-endian bytes for the wire/file format.
    pub fn encode(&self) -> [u8; PART1_SIZE] {
        let mut buf = [0u8; PART1_SIZE];
        let mut off = 0usize;
        macro_rules! put {
            ($val:expr) => {{
                let bytes = $val.to_le_bytes();
                buf[off..off + bytes.len()].copy_from_slice(&bytes);
                off += bytes.len();
            }};
        }
        put!(self.magic);
        put!(self.time);
        put!(self.voltage_mean_kv);
        put!(self.voltage_min_kv);
        put!(self.voltage_max_kv);
        put!(self.current_ma);
        put!(self.pressure_d2_mtorr);
        put!(self.pressure_n2_mtorr);
        for window in &self.cpm {
            for chan in window {
                put!(chan);
            }
        }
        put!(self.data_part2_offset);
        put!(self.data_part2_length);
        for v in &self.channel_valid {
            put!(v);
        }
        put!(self.jpeg_valid);
        debug_assert_eq!(off, PART1_SIZE);
        buf
    }

    /// Parses from little-endian bytes, validating the magic.
    pub fn decode(buf: &[u8]) -> DaqResult<Self> {
        if buf.len() < PART1_SIZE {
            return Err(DaqError::Truncated {
                needed: PART1_SIZE,
                available: buf.len(),
            });
        }
        let mut off = 0usize;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let mut arr = [0u8; N];
                arr.copy_from_slice(&buf[off..off + N]);
                off += N;
                <$ty>::from_le_bytes(arr)
            }};
        }
        let magic = take!(u64);
        if magic != MAGIC_DATA_PART1 {
            return Err(DaqError::ProtocolMagicMismatch {
                expected: MAGIC_DATA_PART1,
                got: magic,
            });
        }
        let time = take!(i64);
        let voltage_mean_kv = take!(f32);
        let voltage_min_kv = take!(f32);
        let voltage_max_kv = take!(f32);
        let current_ma = take!(f32);
        let pressure_d2_mtorr = take!(f32);
        let pressure_n2_mtorr = take!(f32);
        let mut cpm = [[0.0f32; MAX_CHANNEL]; 5];
        for window in &mut cpm {
            for chan in window.iter_mut() {
                *chan = take!(f32);
            }
        }
        let data_part2_offset = take!(u64);
        let data_part2_length = take!(u32);
        let mut channel_valid = [0u32; MAX_ADC_DIAG_CHAN];
        for v in &mut channel_valid {
            *v = take!(u32);
        }
        let jpeg_valid = take!(u32);
        Ok(Part1 {
            magic,
            time,
            voltage_mean_kv,
            voltage_min_kv,
            voltage_max_kv,
            current_ma,
            pressure_d2_mtorr,
            pressure_n2_mtorr,
            cpm,
            data_part2_offset,
            data_part2_length,
            channel_valid,
            jpeg_valid,
        })
    }
}

/// The variable-size half of a one-second record: raw ADC traces plus
/// an optional JPEG frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Part2 {
    /// [`MAGIC_DATA_PART2`].
    pub magic: u64,
    /// Raw millivolt traces, order [`DiagChannel`].
    pub traces: [[i16; MAX_ADC_SAMPLES]; MAX_ADC_DIAG_CHAN],
    /// JPEG bytes, empty when no frame was latched this second.
    pub jpeg: Vec<u8>,
}

impl Part2 {
    /// Byte size of the magic + fixed trace arrays, excluding the
    /// variable-length JPEG tail (used for gap-fill sentinel records).
    pub const HEADER_AND_TRACE_SIZE: usize =
        8 + MAX_ADC_DIAG_CHAN * MAX_ADC_SAMPLES * std::mem::size_of::<i16>() + 4;

    /// An empty Part2 (all-zero traces, no JPEG), used for gap-fills.
    pub fn empty() -> Self {
        Part2 {
            magic: MAGIC_DATA_PART2,
            traces: [[0; MAX_ADC_SAMPLES]; MAX_ADC_DIAG_CHAN],
            jpeg: Vec::new(),
        }
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_AND_TRACE_SIZE + self.jpeg.len()
    }

    /// Serializes to little-endian bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        for trace in &self.traces {
            for &sample in trace {
                buf.extend_from_slice(&sample.to_le_bytes());
            }
        }
        buf.extend_from_slice(&(self.jpeg.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.jpeg);
        buf
    }

    /// Parses from little-endian bytes, validating the magic.
    pub fn decode(buf: &[u8]) -> DaqResult<Self> {
        if buf.len() < Self::HEADER_AND_TRACE_SIZE {
            return Err(DaqError::Truncated {
                needed: Self::HEADER_AND_TRACE_SIZE,
                available: buf.len(),
            });
        }
        let mut off = 0usize;
        let magic = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        off += 8;
        if magic != MAGIC_DATA_PART2 {
            return Err(DaqError::ProtocolMagicMismatch {
                expected: MAGIC_DATA_PART2,
                got: magic,
            });
        }
        let mut traces = [[0i16; MAX_ADC_SAMPLES]; MAX_ADC_DIAG_CHAN];
        for trace in &mut traces {
            for sample in trace.iter_mut() {
                let arr: [u8; 2] = buf[off..off + 2].try_into().expect("2 bytes");
                *sample = i16::from_le_bytes(arr);
                off += 2;
            }
        }
        let jpeg_len =
            u32::from_le_bytes(buf[off..off + 4].try_into().expect("4 bytes")) as usize;
        off += 4;
        if buf.len() < off + jpeg_len {
            return Err(DaqError::Truncated {
                needed: off + jpeg_len,
                available: buf.len(),
            });
        }
        let jpeg = buf[off..off + jpeg_len].to_vec();
        Ok(Part2 {
            magic,
            traces,
            jpeg,
        })
    }
}

/// A complete one-second record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Fixed half.
    pub part1: Part1,
    /// Variable half.
    pub part2: Part2,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_part1() -> Part1 {
        Part1 {
            magic: MAGIC_DATA_PART1,
            time: 1_700_000_000,
            voltage_mean_kv: 12.5,
            voltage_min_kv: 12.0,
            voltage_max_kv: 13.0,
            current_ma: 3.2,
            pressure_d2_mtorr: 150.0,
            pressure_n2_mtorr: ERROR_OVER_PRESSURE,
            cpm: [[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]; 5],
            data_part2_offset: 4096,
            data_part2_length: 8012,
            channel_valid: [1, 1, 1, 0],
            jpeg_valid: 0,
        }
    }

    #[test]
    fn part1_round_trips() {
        let original = sample_part1();
        let bytes = original.encode();
        assert_eq!(bytes.len(), PART1_SIZE);
        let decoded = Part1::decode(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn part1_rejects_bad_magic() {
        let mut bytes = sample_part1().encode();
        bytes[0] = 0xff;
        let err = Part1::decode(&bytes).unwrap_err();
        assert!(matches!(err, DaqError::ProtocolMagicMismatch { .. }));
    }

    #[test]
    fn part1_rejects_truncated_buffer() {
        let bytes = sample_part1().encode();
        let err = Part1::decode(&bytes[..10]).unwrap_err();
        assert!(matches!(err, DaqError::Truncated { .. }));
    }

    #[test]
    fn part2_round_trips_with_jpeg() {
        let mut part2 = Part2::empty();
        part2.traces[DiagChannel::Voltage as usize][0] = -42;
        part2.jpeg = vec![0xff, 0xd8, 0xff, 0xd9];
        let bytes = part2.encode();
        let decoded = Part2::decode(&bytes).unwrap();
        assert_eq!(part2, decoded);
    }

    #[test]
    fn gauge_reading_sentinel_round_trip() {
        assert_eq!(
            GaugeReading::from_wire_f32(GaugeReading::Faulty.to_wire_f32()),
            GaugeReading::Faulty
        );
        assert_eq!(
            GaugeReading::from_wire_f32(GaugeReading::OverPressure.to_wire_f32()),
            GaugeReading::OverPressure
        );
        assert_eq!(
            GaugeReading::from_wire_f32(GaugeReading::NoValue.to_wire_f32()),
            GaugeReading::NoValue
        );
        assert_eq!(
            GaugeReading::from_wire_f32(42.0),
            GaugeReading::Value(42.0)
        );
    }

    #[test]
    fn no_value_record_has_sentinel_gauges() {
        let part1 = Part1::no_value(100);
        assert_eq!(
            GaugeReading::from_wire_f32(part1.voltage_mean_kv),
            GaugeReading::NoValue
        );
    }
}
