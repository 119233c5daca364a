//! Criterion benchmarks for `LogStore`'s hot paths.
//!
//! These establish baselines for the once-per-second Recorder append
//! path and the DisplayDriver's mmap read path, the two operations
//! that actually run on a clock in this system.
//!
//! Run with: cargo bench --bench log_store

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fusor_daq::record::{Part1, Part2, MAGIC_DATA_PART1, MAX_CHANNEL};
use fusor_daq::log_store::LogStore;

fn part1_at(time: i64) -> Part1 {
    Part1 {
        magic: MAGIC_DATA_PART1,
        time,
        voltage_mean_kv: 10.0,
        voltage_min_kv: 9.5,
        voltage_max_kv: 10.5,
        current_ma: 5.0,
        pressure_d2_mtorr: 100.0,
        pressure_n2_mtorr: 120.0,
        cpm: [[1.0; MAX_CHANNEL]; 5],
        data_part2_offset: 0,
        data_part2_length: Part2::HEADER_AND_TRACE_SIZE as u32,
        channel_valid: [1; 4],
        jpeg_valid: 0,
    }
}

/// Benchmark the append path: mmap'd Part1 write plus a positioned
/// Part2 write, the two operations Recorder performs every second.
fn log_store_append(c: &mut Criterion) {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("bench_log.dat");
    let store = LogStore::create(&path, 1_000_000).unwrap();

    let mut time = 0i64;
    c.bench_function("log_store_append", |b| {
        b.iter(|| {
            let part1 = part1_at(black_box(time));
            store.append(&part1, &Part2::empty()).unwrap();
            time += 1;
        });
    });
}

/// Benchmark reading Part1 through the mmap view, the DisplayDriver's
/// per-frame cursor read.
fn log_store_read_part1(c: &mut Criterion) {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("bench_log.dat");
    let store = LogStore::create(&path, 10_000).unwrap();
    for t in 0..1_000i64 {
        store.append(&part1_at(t), &Part2::empty()).unwrap();
    }

    c.bench_function("log_store_read_part1", |b| {
        b.iter(|| {
            let part1 = store.read_part1(black_box(500)).unwrap();
            black_box(part1);
        });
    });
}

/// Benchmark reading Part2 through the one-entry read cache, both on
/// a cache hit (repeated index) and a cache miss (alternating index).
fn log_store_read_part2(c: &mut Criterion) {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("bench_log.dat");
    let store = LogStore::create(&path, 10_000).unwrap();
    for t in 0..1_000i64 {
        store.append(&part1_at(t), &Part2::empty()).unwrap();
    }

    c.bench_function("log_store_read_part2_cache_hit", |b| {
        b.iter(|| {
            let part2 = store.read_part2(black_box(500)).unwrap();
            black_box(part2);
        });
    });

    let mut idx = 0u32;
    c.bench_function("log_store_read_part2_cache_miss", |b| {
        b.iter(|| {
            let part2 = store.read_part2(black_box(idx % 1_000)).unwrap();
            black_box(part2);
            idx += 2;
        });
    });
}

criterion_group!(
    benches,
    log_store_append,
    log_store_read_part1,
    log_store_read_part2
);
criterion_main!(benches);
