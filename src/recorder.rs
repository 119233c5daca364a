//! Recorder: write-path policy over [`LogStore`] — pre-write
//! validation, idempotence, and gap-filling — per spec.md §4.7.

use tracing::warn;

use crate::error::{DaqError, DaqResult};
use crate::log_store::LogStore;
use crate::record::{Part1, Part2, Record};

/// Enforces the time-sequence invariant and gap-filling policy on top
/// of a [`LogStore`], so the store itself only ever sees strictly
/// monotonic, contiguous record times.
pub struct Recorder {
    store: LogStore,
    last_time: Option<i64>,
}

impl Recorder {
    /// Wraps `store`, resuming `last_time` from its last committed
    /// record if it already holds any.
    pub fn new(store: LogStore) -> DaqResult<Self> {
        let last_time = if store.max() > 0 {
            Some(store.read_part1(store.max() - 1)?.time)
        } else {
            None
        };
        Ok(Recorder { store, last_time })
    }

    /// Shared access to the underlying store, for a display/playback
    /// reader that shares the same process.
    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Records one fused second.
    ///
    /// - A record whose time duplicates the last one written is
    ///   dropped with a warning (idempotence, spec.md §8).
    /// - A record whose time is behind `last_time + 1` is a
    ///   programming-invariant violation once in steady state: fatal.
    /// - Otherwise, synthesizes [`Part1::no_value`]/[`Part2::empty`]
    ///   records for every second in `(last_time, record.time)`, then
    ///   writes the real record.
    pub fn record(&mut self, record: Record) -> DaqResult<()> {
        let Some(last) = self.last_time else {
            self.store.append(&record.part1, &record.part2)?;
            self.last_time = Some(record.part1.time);
            return Ok(());
        };

        if record.part1.time == last {
            warn!(time = last, "Recorder dropped duplicate record");
            return Ok(());
        }
        if record.part1.time < last {
            return Err(DaqError::TimeSequenceViolation {
                expected: last + 1,
                got: record.part1.time,
            });
        }

        for gap_time in (last + 1)..record.part1.time {
            warn!(time = gap_time, "Recorder gap-filling missing second");
            self.store
                .append(&Part1::no_value(gap_time), &Part2::empty())?;
        }

        self.store.append(&record.part1, &record.part2)?;
        self.last_time = Some(record.part1.time);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{GaugeReading, MAGIC_DATA_PART1};

    fn record_at(time: i64) -> Record {
        Record {
            part1: Part1 {
                magic: MAGIC_DATA_PART1,
                time,
                voltage_mean_kv: 1.0,
                voltage_min_kv: 1.0,
                voltage_max_kv: 1.0,
                current_ma: 1.0,
                pressure_d2_mtorr: 1.0,
                pressure_n2_mtorr: 1.0,
                cpm: [[0.0; 8]; 5],
                data_part2_offset: 0,
                data_part2_length: Part2::HEADER_AND_TRACE_SIZE as u32,
                channel_valid: [1, 1, 1, 1],
                jpeg_valid: 0,
            },
            part2: Part2::empty(),
        }
    }

    fn new_recorder(dir: &tempfile::TempDir) -> Recorder {
        let store = LogStore::create(dir.path().join("log.dat"), 1000).unwrap();
        Recorder::new(store).unwrap()
    }

    #[test]
    fn scenario_2_gap_fill() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = new_recorder(&dir);

        recorder.record(record_at(100)).unwrap();
        recorder.record(record_at(103)).unwrap();

        assert_eq!(recorder.store().max(), 4);
        for (idx, &time) in [100i64, 101, 102, 103].iter().enumerate() {
            let part1 = recorder.store().read_part1(idx as u32).unwrap();
            assert_eq!(part1.time, time);
        }
        assert!(matches!(
            GaugeReading::from_wire_f32(
                recorder.store().read_part1(1).unwrap().voltage_mean_kv
            ),
            GaugeReading::NoValue
        ));
        assert!(matches!(
            GaugeReading::from_wire_f32(
                recorder.store().read_part1(0).unwrap().voltage_mean_kv
            ),
            GaugeReading::Value(_)
        ));

        recorder.record(record_at(108)).unwrap();
        assert_eq!(recorder.store().max(), 9);
        for (idx, &time) in [104i64, 105, 106, 107].iter().enumerate() {
            let part1 = recorder.store().read_part1(4 + idx as u32).unwrap();
            assert_eq!(part1.time, time);
            assert!(matches!(
                GaugeReading::from_wire_f32(part1.voltage_mean_kv),
                GaugeReading::NoValue
            ));
        }
        assert_eq!(recorder.store().read_part1(8).unwrap().time, 108);
    }

    #[test]
    fn duplicate_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = new_recorder(&dir);
        recorder.record(record_at(100)).unwrap();
        recorder.record(record_at(100)).unwrap();
        assert_eq!(recorder.store().max(), 1);
    }

    #[test]
    fn time_regression_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = new_recorder(&dir);
        recorder.record(record_at(100)).unwrap();
        let err = recorder.record(record_at(50));
        assert!(matches!(err, Err(DaqError::TimeSequenceViolation { .. })));
    }

    #[test]
    fn resumes_last_time_from_reopened_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        {
            let store = LogStore::create(&path, 1000).unwrap();
            let mut recorder = Recorder::new(store).unwrap();
            recorder.record(record_at(100)).unwrap();
        }
        let store = LogStore::open(&path, 1000).unwrap();
        let mut recorder = Recorder::new(store).unwrap();
        recorder.record(record_at(102)).unwrap();
        assert_eq!(recorder.store().max(), 3);
    }
}
