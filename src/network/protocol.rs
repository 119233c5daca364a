//! Wire-level send/receive helpers wrapping [`crate::record`]'s
//! encode/decode, per spec.md §6.1.
//!
//! Grounded on the donor's `network/protocol.rs`: manual byte-offset
//! encode/decode and explicit bounds-checked `Result` reads, same
//! style, new field layout.

use std::io::{Read, Write};

use crate::error::{DaqError, DaqResult};
use crate::record::{Part1, Part2, Record, PART1_SIZE};

/// Upper bound on a single Part2 payload, guarding against a corrupt
/// or malicious `data_part2_length` driving an unbounded allocation.
pub const MAX_DATA_PART2_LENGTH: usize = 2_000_000;

/// Writes `record` as Part1 then Part2, back-to-back, per spec.md
/// §4.6's network framing.
pub fn send_record(stream: &mut impl Write, record: &Record) -> DaqResult<()> {
    stream.write_all(&record.part1.encode())?;
    stream.write_all(&record.part2.encode())?;
    Ok(())
}

/// Reads one record: Part1 fully (validating its magic), then exactly
/// `Part1.data_part2_length` bytes of Part2 (validating its magic),
/// per spec.md §4.8 step 1–2.
pub fn recv_record(stream: &mut impl Read) -> DaqResult<Record> {
    let mut part1_buf = [0u8; PART1_SIZE];
    stream.read_exact(&mut part1_buf)?;
    let part1 = Part1::decode(&part1_buf)?;

    let len = part1.data_part2_length as usize;
    if len > MAX_DATA_PART2_LENGTH {
        return Err(DaqError::Truncated {
            needed: len,
            available: MAX_DATA_PART2_LENGTH,
        });
    }
    let mut part2_buf = vec![0u8; len];
    stream.read_exact(&mut part2_buf)?;
    let part2 = Part2::decode(&part2_buf)?;

    Ok(Record { part1, part2 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MAGIC_DATA_PART1;

    fn sample_record() -> Record {
        Record {
            part1: Part1 {
                magic: MAGIC_DATA_PART1,
                time: 42,
                voltage_mean_kv: 1.0,
                voltage_min_kv: 1.0,
                voltage_max_kv: 1.0,
                current_ma: 1.0,
                pressure_d2_mtorr: 1.0,
                pressure_n2_mtorr: 1.0,
                cpm: [[0.0; 8]; 5],
                data_part2_offset: 0,
                data_part2_length: Part2::HEADER_AND_TRACE_SIZE as u32,
                channel_valid: [1; 4],
                jpeg_valid: 0,
            },
            part2: Part2::empty(),
        }
    }

    #[test]
    fn send_then_recv_round_trips() {
        let record = sample_record();
        let mut buf = Vec::new();
        send_record(&mut buf, &record).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = recv_record(&mut cursor).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn recv_rejects_oversized_length() {
        let mut record = sample_record();
        record.part1.data_part2_length = (MAX_DATA_PART2_LENGTH + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&record.part1.encode());
        let mut cursor = std::io::Cursor::new(buf);
        let err = recv_record(&mut cursor);
        assert!(err.is_err());
    }
}
