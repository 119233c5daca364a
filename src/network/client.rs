//! Live-acquisition client loop, per spec.md §4.8.
//!
//! Grounded on the donor's reconnect-with-backoff client shape,
//! translated to blocking `std::net::TcpStream` + `std::thread`, and
//! on [`crate::recorder::Recorder`] for the shared gap-fill/
//! monotonicity policy this loop must mirror locally.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{error, warn};

use crate::error::{DaqError, DaqResult};
use crate::fuser::JpegLatch;
use crate::network::protocol::recv_record;
use crate::record::{Part2, Record};
use crate::recorder::Recorder;

/// Receive timeout on the live connection (spec.md §4.8 step 0).
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on `|server_time - local_time|` before entering Time-Error.
const MAX_DRIFT_SECS: i64 = 5;
/// Sleep between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Runs the live-acquisition loop until `exiting` is set or the
/// connection enters a terminal Time-Error state. `jpeg_latch`, if
/// present, supplies this client's own camera frames to splice into a
/// server record whose Part2 lacks one, per spec.md §4.8 step 3.
pub fn run(
    server_addr: &str,
    recorder: &mut Recorder,
    jpeg_latch: Option<&JpegLatch>,
    exiting: &Arc<AtomicBool>,
) -> DaqResult<()> {
    while !exiting.load(Ordering::Acquire) {
        match connect_and_stream(server_addr, recorder, jpeg_latch, exiting) {
            Ok(()) => return Ok(()),
            Err(DaqError::TimeDrift { delta_secs }) => {
                error!(delta_secs, "live connection entered terminal Time-Error state");
                return Err(DaqError::TimeDrift { delta_secs });
            }
            Err(e) => {
                warn!(error = %e, "live connection lost, reconnecting");
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }
    Ok(())
}

/// One connection attempt: connects, then loops receiving records
/// until IO fails or `exiting` is observed. Returns `Ok(())` only when
/// asked to exit cleanly; any connection failure is returned as `Err`
/// so the caller can back off and retry.
fn connect_and_stream(
    server_addr: &str,
    recorder: &mut Recorder,
    jpeg_latch: Option<&JpegLatch>,
    exiting: &Arc<AtomicBool>,
) -> DaqResult<()> {
    let mut stream = TcpStream::connect(server_addr)?;
    stream.set_read_timeout(Some(RECV_TIMEOUT))?;
    stream.set_nodelay(true)?;

    loop {
        if exiting.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut record = match recv_record(&mut stream) {
            Ok(r) => r,
            Err(DaqError::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(DaqError::ConnectionLost(to_io_error(e))),
        };

        splice_local_jpeg(&mut record, jpeg_latch, now_secs() * 1_000_000);

        let local_time = now_secs();
        let delta = (record.part1.time - local_time).abs();
        if delta > MAX_DRIFT_SECS {
            return Err(DaqError::TimeDrift { delta_secs: delta });
        }

        recorder.record(record)?;
    }
}

/// If the server's Part2 carries no JPEG and this client has one
/// fresh enough (spec.md §4.8 step 3's ≤ 1 s staleness rule), splices
/// it in and marks `jpeg_valid`.
fn splice_local_jpeg(record: &mut Record, jpeg_latch: Option<&JpegLatch>, now_us: i64) {
    if record.part1.jpeg_valid != 0 {
        return;
    }
    let Some(latch) = jpeg_latch else { return };
    if let Some(jpeg) = latch.take_if_fresh(now_us) {
        record.part1.jpeg_valid = 1;
        record.part1.data_part2_length =
            (Part2::HEADER_AND_TRACE_SIZE + jpeg.len()) as u32;
        record.part2.jpeg = jpeg;
    }
}

fn to_io_error(e: DaqError) -> std::io::Error {
    match e {
        DaqError::Io(io) => io,
        other => std::io::Error::new(ErrorKind::Other, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::LogStore;
    use crate::record::{GaugeReading, Part1, MAGIC_DATA_PART1};
    use std::net::TcpListener;

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
                channel_valid: [1; 4],
                jpeg_valid: 0,
            },
            part2: Part2::empty(),
        }
    }

    #[test]
    fn splice_skips_when_server_already_has_jpeg() {
        let mut record = record_at(1);
        record.part1.jpeg_valid = 1;
        let latch = JpegLatch::default();
        latch.set(vec![1, 2, 3], 0);
        splice_local_jpeg(&mut record, Some(&latch), 0);
        assert!(record.part2.jpeg.is_empty());
    }

    #[test]
    fn splice_fills_in_fresh_local_jpeg() {
        let mut record = record_at(1);
        let latch = JpegLatch::default();
        latch.set(vec![1, 2, 3], 1_000_000);
        splice_local_jpeg(&mut record, Some(&latch), 1_000_000);
        assert_eq!(record.part2.jpeg, vec![1, 2, 3]);
        assert_eq!(record.part1.jpeg_valid, 1);
    }

    #[test]
    fn splice_drops_stale_local_jpeg() {
        let mut record = record_at(1);
        let latch = JpegLatch::default();
        latch.set(vec![1, 2, 3], 0);
        splice_local_jpeg(&mut record, Some(&latch), 5_000_000);
        assert!(record.part2.jpeg.is_empty());
        assert_eq!(record.part1.jpeg_valid, 0);
    }

    #[test]
    fn gap_fill_recorder_matches_server_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log.dat"), 100).unwrap();
        let mut recorder = Recorder::new(store).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            use crate::network::protocol::send_record;
            send_record(&mut stream, &record_at(now_secs())).unwrap();
            send_record(&mut stream, &record_at(now_secs() + 3)).unwrap();
        });

        let exiting = Arc::new(AtomicBool::new(false));
        let exiting_for_timer = Arc::clone(&exiting);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            exiting_for_timer.store(true, Ordering::Release);
        });

        let _ = run(&addr.to_string(), &mut recorder, None, &exiting);
        server.join().unwrap();
        assert!(recorder.store().max() >= 2);
    }
}
