//! LogStore: the content-addressed, memory-mapped two-region log file,
//! per spec.md §4.7/§6.2.
//!
//! Grounded on the donor's `data/ring_buffer.rs`: release-fenced
//! monotonic counter publication, the `mmap` create-or-open-without-
//! truncation guard, and a `#[repr(C)]` header with a compile-time
//! `size_of` assertion are all carried over, adapted from a circular
//! ring to this spec's two-region (fixed Part1 array + append-only
//! Part2 heap) layout. Positioned reads/writes into the Part2 region
//! use `FileExt::{read_at,write_at}` rather than growing the mmap,
//! since Part2 is unbounded and append-only across the file's life.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{DaqError, DaqResult};
use crate::record::{Part1, Part2, PART1_SIZE};

/// Log file magic (distinct from the wire-protocol Part1/Part2 magics).
pub const MAGIC_LOG_FILE: u64 = 0xaabb_ccdd_4c4f_4731;

/// Fixed header size, bytes (spec.md §6.2).
pub const HEADER_SIZE: usize = 4096;

#[repr(C)]
struct LogFileHeader {
    magic: u64,
    start_time: i64,
    max: AtomicU32,
    _reserved: [u8; HEADER_SIZE - 8 - 8 - 4],
}

const _: () = assert!(std::mem::size_of::<LogFileHeader>() == HEADER_SIZE);

/// Computes the byte offset the Part2 region begins at, per spec.md
/// §6.2: `(sizeof(header) + sizeof(Part1)*MAX_FILE_DATA_PART1 +
/// 0x1000) & ~0xFFF`.
pub fn part2_region_start(max_records: u32) -> u64 {
    let raw = HEADER_SIZE as u64 + PART1_SIZE as u64 * max_records as u64 + 0x1000;
    raw & !0xFFFu64
}

/// A cached, already-validated Part2 read, keyed by its record index,
/// per spec.md §4.7's one-entry Part2 read cache.
struct Part2Cache {
    idx: u32,
    part2: Part2,
}

/// The mmap'd log file: a fixed Part1 array plus an append-only Part2
/// heap, addressed by record index.
///
/// # Safety
/// `header`/`part1_base` are raw pointers into `mmap`; they are valid
/// for exactly as long as `mmap` (kept alive as a field) lives. `max`
/// is published with release ordering on write and read with acquire
/// ordering, so any reader observing `max == N` is guaranteed to see
/// `Part1[0..N)` fully initialized, per spec.md §5's ordering
/// guarantee for monotonic counters.
pub struct LogStore {
    #[allow(dead_code)]
    mmap: MmapMut,
    header: *mut LogFileHeader,
    part1_base: *mut u8,
    file: File,
    max_records: u32,
    part2_start: u64,
    part2_cursor: std::sync::atomic::AtomicU64,
    read_cache: Mutex<Option<Part2Cache>>,
}

// SAFETY: all access to `header`/`part1_base` goes through atomic
// loads/stores on `max` (acquire/release) or through the single-writer
// append path; the raw pointers themselves are never read without
// first synchronizing through `max`.
unsafe impl Send for LogStore {}
// SAFETY: concurrent readers only ever observe slots below the
// acquire-loaded `max`, which are never mutated again once published.
unsafe impl Sync for LogStore {}

impl LogStore {
    /// Creates a new log file at `path`, which must not already exist
    /// and must have a `.dat` extension, per spec.md §6.2.
    pub fn create(path: impl AsRef<Path>, max_records: u32) -> DaqResult<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("dat") {
            return Err(DaqError::InvalidConfig(format!(
                "log file {path:?} must have a .dat extension"
            )));
        }
        if path.exists() {
            return Err(DaqError::LogFileExists(path.display().to_string()));
        }

        let part2_start = part2_region_start(max_records);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(part2_start)?;

        // SAFETY: the file was just created and sized, so the mapping
        // covers exactly the header + Part1 region.
        let mut mmap = unsafe { MmapOptions::new().len(part2_start as usize).map_mut(&file)? };

        let header = mmap.as_mut_ptr() as *mut LogFileHeader;
        // SAFETY: mmap is at least HEADER_SIZE bytes.
        unsafe {
            (*header).magic = MAGIC_LOG_FILE;
            (*header).start_time = 0;
            (*header).max = AtomicU32::new(0);
            (*header)._reserved.fill(0);
        }
        let part1_base = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        Ok(LogStore {
            mmap,
            header,
            part1_base,
            file,
            max_records,
            part2_start,
            part2_cursor: std::sync::atomic::AtomicU64::new(0),
            read_cache: Mutex::new(None),
        })
    }

    /// Opens an existing log file for reading (and, if the caller
    /// holds the writer role, appending).
    pub fn open(path: impl AsRef<Path>, max_records: u32) -> DaqResult<Self> {
        let path = path.as_ref();
        let part2_start = part2_region_start(max_records);
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: the file is assumed to have been created by `create`
        // and is therefore at least `part2_start` bytes.
        let mut mmap = unsafe { MmapOptions::new().len(part2_start as usize).map_mut(&file)? };
        let header = mmap.as_mut_ptr() as *mut LogFileHeader;
        // SAFETY: header points at a valid LogFileHeader written by `create`.
        let magic = unsafe { (*header).magic };
        if magic != MAGIC_LOG_FILE {
            return Err(DaqError::LogFileCorrupt(format!(
                "bad header magic {magic:#x}"
            )));
        }
        let part1_base = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };
        let file_len = file.metadata()?.len();
        let part2_cursor = file_len.saturating_sub(part2_start);

        Ok(LogStore {
            mmap,
            header,
            part1_base,
            file,
            max_records,
            part2_start,
            part2_cursor: std::sync::atomic::AtomicU64::new(part2_cursor),
            read_cache: Mutex::new(None),
        })
    }

    /// Number of committed records, acquire-loaded.
    pub fn max(&self) -> u32 {
        // SAFETY: header is valid for the lifetime of `self`.
        unsafe { (*self.header).max.load(Ordering::Acquire) }
    }

    /// Epoch-seconds timestamp of record 0, once at least one record
    /// has been written.
    pub fn start_time(&self) -> i64 {
        // SAFETY: header is valid for the lifetime of `self`.
        unsafe { (*self.header).start_time }
    }

    /// Maximum record capacity this file was created with.
    pub fn max_records(&self) -> u32 {
        self.max_records
    }

    /// Appends one record. Single-writer only (spec.md §5); callers
    /// (`Recorder`) are responsible for time-sequence and idempotence
    /// checks before calling this.
    ///
    /// Write order, per spec.md §4.7: stamp `part1.data_part2_offset`,
    /// mmap the Part1 slot, positioned-write Part2, then publish `max
    /// += 1` with a release fence.
    pub fn append(&self, part1: &Part1, part2: &Part2) -> DaqResult<()> {
        let max = self.max();
        if max >= self.max_records {
            return Err(DaqError::LogFileFull);
        }

        let offset = self.part2_cursor.load(Ordering::Relaxed);
        let mut stamped = *part1;
        stamped.data_part2_offset = offset;
        stamped.data_part2_length = part2.encoded_len() as u32;

        let part2_bytes = part2.encode();
        self.file
            .write_at(&part2_bytes, self.part2_start + offset)?;
        self.part2_cursor
            .fetch_add(part2_bytes.len() as u64, Ordering::Relaxed);

        let slot_offset = max as usize * PART1_SIZE;
        let encoded = stamped.encode();
        // SAFETY: slot_offset + PART1_SIZE is within the mapped Part1
        // region since max < self.max_records.
        unsafe {
            let dest = self.part1_base.add(slot_offset);
            std::ptr::copy_nonoverlapping(encoded.as_ptr(), dest, PART1_SIZE);
        }

        if max == 0 {
            // SAFETY: single writer, header valid.
            unsafe {
                (*self.header).start_time = stamped.time;
            }
        }

        fence(Ordering::Release);
        // SAFETY: header valid.
        unsafe {
            (*self.header).max.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    /// Reads record `idx`'s Part1, after validating `idx < max`
    /// (acquire ordering — see spec.md §5's publication guarantee).
    pub fn read_part1(&self, idx: u32) -> DaqResult<Part1> {
        if idx >= self.max() {
            return Err(DaqError::InvalidConfig(format!(
                "record index {idx} out of range"
            )));
        }
        let slot_offset = idx as usize * PART1_SIZE;
        // SAFETY: slot_offset + PART1_SIZE < mapped region, since idx < max <= max_records.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.part1_base.add(slot_offset), PART1_SIZE)
        };
        Part1::decode(bytes)
    }

    /// Reads record `idx`'s Part2, honoring the one-entry cache.
    /// Fatal (`DaqError::LogFileCorrupt`) on a magic mismatch — per
    /// spec.md §4.7, the file is considered corrupt.
    pub fn read_part2(&self, idx: u32) -> DaqResult<Part2> {
        {
            let cache = self.read_cache.lock().expect("read cache mutex poisoned");
            if let Some(entry) = cache.as_ref() {
                if entry.idx == idx {
                    return Ok(entry.part2.clone());
                }
            }
        }

        let part1 = self.read_part1(idx)?;
        let mut buf = vec![0u8; part1.data_part2_length as usize];
        self.file
            .read_at(&mut buf, self.part2_start + part1.data_part2_offset)?;
        let part2 = Part2::decode(&buf)
            .map_err(|e| DaqError::LogFileCorrupt(format!("record {idx}: {e}")))?;

        let mut cache = self.read_cache.lock().expect("read cache mutex poisoned");
        *cache = Some(Part2Cache {
            idx,
            part2: part2.clone(),
        });
        Ok(part2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GaugeReading;

    fn sample_part1(time: i64) -> Part1 {
        Part1::no_value(time)
    }

    #[test]
    fn create_rejects_non_dat_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let err = LogStore::create(&path, 100);
        assert!(err.is_err());
    }

    #[test]
    fn create_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        std::fs::write(&path, b"x").unwrap();
        let err = LogStore::create(&path, 100);
        assert!(matches!(err, Err(DaqError::LogFileExists(_))));
    }

    #[test]
    fn append_and_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        let store = LogStore::create(&path, 100).unwrap();

        let part1 = sample_part1(1_700_000_000);
        let part2 = Part2::empty();
        store.append(&part1, &part2).unwrap();

        assert_eq!(store.max(), 1);
        assert_eq!(store.start_time(), 1_700_000_000);

        let read_part1 = store.read_part1(0).unwrap();
        assert_eq!(read_part1.time, 1_700_000_000);
        assert_eq!(
            GaugeReading::from_wire_f32(read_part1.voltage_mean_kv),
            GaugeReading::NoValue
        );

        let read_part2 = store.read_part2(0).unwrap();
        assert_eq!(read_part2, part2);
    }

    #[test]
    fn read_part1_rejects_out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        let store = LogStore::create(&path, 10).unwrap();
        assert!(store.read_part1(0).is_err());
    }

    #[test]
    fn append_fails_once_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        let store = LogStore::create(&path, 1).unwrap();
        store.append(&sample_part1(1), &Part2::empty()).unwrap();
        let err = store.append(&sample_part1(2), &Part2::empty());
        assert!(matches!(err, Err(DaqError::LogFileFull)));
    }

    #[test]
    fn reopened_file_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        {
            let store = LogStore::create(&path, 100).unwrap();
            store.append(&sample_part1(500), &Part2::empty()).unwrap();
        }
        let reopened = LogStore::open(&path, 100).unwrap();
        assert_eq!(reopened.max(), 1);
        assert_eq!(reopened.read_part1(0).unwrap().time, 500);
    }

    #[test]
    fn part2_with_jpeg_round_trips_distinct_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");
        let store = LogStore::create(&path, 10).unwrap();

        let mut part2_a = Part2::empty();
        part2_a.jpeg = vec![1, 2, 3];
        store.append(&sample_part1(1), &part2_a).unwrap();

        let mut part2_b = Part2::empty();
        part2_b.jpeg = vec![4, 5, 6, 7];
        store.append(&sample_part1(2), &part2_b).unwrap();

        let p1_a = store.read_part1(0).unwrap();
        let p1_b = store.read_part1(1).unwrap();
        assert!(p1_a.data_part2_offset < p1_b.data_part2_offset);

        assert_eq!(store.read_part2(0).unwrap().jpeg, vec![1, 2, 3]);
        assert_eq!(store.read_part2(1).unwrap().jpeg, vec![4, 5, 6, 7]);
    }
}
