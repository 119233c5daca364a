//! CameraAcquirer: V4L2-style MJPEG buffer streaming, per spec.md
//! §4.5.
//!
//! Grounded on `original_source/util_cam.c`'s `cam_get_buff`/
//! `cam_put_buff` (drain-dequeued-buffers, backlog>3 discard, 2 s/1 ms
//! poll timeout) generalized behind [`FrameSource`], the same shape
//! the donor's `hardware/pvcam.rs` uses to separate a real device
//! binding from a deterministic mock. Camera capture and JPEG decoding
//! are themselves out of scope (spec.md §1).
//!
//! Note: `util_cam.c`'s own comment above its final return says it
//! returns "the oldest in buffer_avail", but spec.md §4.5 explicitly
//! states `get_buff()` "requeues all but the newest, and returns the
//! newest" — this module follows spec.md's explicit wording.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{DaqError, DaqResult};

/// Total poll timeout for a buffer to become available.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(2);
/// Poll interval while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Backlog depth past which surplus dequeued buffers are discarded.
pub const BACKLOG_DISCARD_THRESHOLD: usize = 3;
/// Staleness cutoff for the Fuser's JPEG latch, microseconds.
pub const STALENESS_US: i64 = 1_000_000;

/// One dequeued camera buffer.
#[derive(Debug, Clone)]
pub struct CameraBuffer {
    /// Opaque index the driver uses to requeue this buffer.
    pub index: u32,
    /// MJPEG-encoded frame bytes.
    pub jpeg: Vec<u8>,
    /// Capture timestamp, microseconds since the Unix epoch.
    pub capture_us: i64,
}

/// The out-of-scope camera driver/JPEG-decode collaborator (spec.md
/// §1), modeled as a trait so [`CameraAcquirer`] can drive either a
/// real V4L2 binding or [`SimulatedFrameSource`].
pub trait FrameSource: Send {
    /// Attempts to dequeue one buffer without blocking. `Ok(None)`
    /// means none is currently ready.
    fn try_dequeue(&mut self) -> DaqResult<Option<CameraBuffer>>;
    /// Requeues buffer `index` to the driver.
    fn requeue(&mut self, index: u32);
}

/// Deterministic camera simulation: produces a new buffer on every
/// Nth poll, used by tests and the synthetic-file generator.
pub struct SimulatedFrameSource {
    next_index: u32,
    polls_per_frame: u32,
    poll_count: u32,
    now_us: i64,
}

impl SimulatedFrameSource {
    /// Creates a source that yields a new frame every `polls_per_frame`
    /// calls to `try_dequeue`, stamped with `now_us()` as the capture time.
    pub fn new(polls_per_frame: u32) -> Self {
        SimulatedFrameSource {
            next_index: 0,
            polls_per_frame: polls_per_frame.max(1),
            poll_count: 0,
            now_us: 0,
        }
    }

    /// Advances the simulated wall clock, microseconds.
    pub fn advance_us(&mut self, delta_us: i64) {
        self.now_us += delta_us;
    }
}

impl FrameSource for SimulatedFrameSource {
    fn try_dequeue(&mut self) -> DaqResult<Option<CameraBuffer>> {
        self.poll_count += 1;
        if self.poll_count % self.polls_per_frame != 0 {
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(CameraBuffer {
            index,
            jpeg: vec![0xff, 0xd8, 0xff, 0xd9],
            capture_us: self.now_us,
        }))
    }

    fn requeue(&mut self, _index: u32) {}
}

/// Drains and requeues buffers from a [`FrameSource`], per spec.md
/// §4.5's `get_buff`/`put_buff` semantics.
pub struct CameraAcquirer {
    source: Box<dyn FrameSource>,
}

impl CameraAcquirer {
    /// Wraps `source`.
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        CameraAcquirer { source }
    }

    /// Drains all currently-dequeued buffers, requeues all but the
    /// newest, and returns the newest. Buffers past
    /// [`BACKLOG_DISCARD_THRESHOLD`] backlogged are requeued with a
    /// warning before the "keep only the newest" step runs. Blocks up
    /// to [`POLL_TIMEOUT`], polling every [`POLL_INTERVAL`]; returns
    /// `Err(DaqError::CameraTimeout)` if nothing arrives in time.
    pub fn get_buff(&mut self) -> DaqResult<CameraBuffer> {
        let deadline = Instant::now() + POLL_TIMEOUT;
        let mut avail: Vec<CameraBuffer> = Vec::new();

        loop {
            while let Some(buf) = self.source.try_dequeue()? {
                avail.push(buf);
            }

            if !avail.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                return Err(DaqError::CameraTimeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        if avail.len() > BACKLOG_DISCARD_THRESHOLD {
            let newest = avail.pop().expect("avail is non-empty");
            for stale in avail {
                warn!(index = stale.index, "camera buffer backlogged, discarding");
                self.source.requeue(stale.index);
            }
            return Ok(newest);
        }

        let newest = avail.pop().expect("avail is non-empty");
        for older in avail {
            self.source.requeue(older.index);
        }
        Ok(newest)
    }

    /// Requeues buffer `index` to the driver, per `cam_put_buff`.
    pub fn put_buff(&mut self, index: u32) {
        self.source.requeue(index);
    }
}
