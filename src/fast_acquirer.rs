//! FastAcquirer: producer/consumer pair driving the fast-ADC (USB bulk)
//! stream into [`crate::pulse_detector::PulseDetector`], per spec.md
//! §4.3.
//!
//! Grounded on `original_source/util_mccdaq.c`: the
//! `{NOT_INITIALIZED, STOPPED, RUNNING, STOPPING}` state machine, the
//! producer's restart-on-error policy (clear halt, restart the scan,
//! bump `g_restart_count`), the zero-length-packet drain quirk, and the
//! consumer's backlog-discard policy all come from that file. The USB
//! driver SDK itself is out of scope (spec.md §1), so the bulk endpoint
//! is modeled behind [`FastAdcDevice`]; `util_mccdaq.c`'s own `#ifdef
//! MCCDAQ_TEST` branch (a ramping ~2048±1 baseline with injected
//! pulses) is generalized here into [`SimulatedFastAdc`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

mod ring {
    use super::MAX_DATA;

    /// Lock-free circular sample buffer shared between exactly one
    /// producer and one consumer thread, per spec.md §1's "lock-free
    /// producer/consumer pipeline."
    ///
    /// Grounded on `data/ring_buffer.rs`'s raw-pointer layout, adapted
    /// from that type's multi-writer seqlock (`write_lock: Mutex<()>`
    /// plus an epoch counter) down to the strictly single-producer,
    /// single-consumer case this module actually has: the producer is
    /// the only writer, so no write lock is needed at all, and the
    /// existing `produced`/`consumed` `AtomicU64` cursors in
    /// `FastAcquirer` already give the release/acquire synchronization
    /// a seqlock epoch would otherwise provide. The consumer never
    /// reads a slot the producer hasn't published via the
    /// release-ordered `produced` store, and the producer never
    /// overwrites a slot the consumer hasn't yet drained (enforced by
    /// `BACKLOG_DISCARD_THRESHOLD` staying well under `MAX_DATA`).
    pub struct SampleBuffer {
        #[expect(dead_code, reason = "kept alive to maintain the raw pointer's validity")]
        storage: Box<[u16]>,
        ptr: *mut u16,
    }

    // SAFETY: the boxed storage is heap-allocated once in `new` and never
    // moved or reallocated afterward, so `ptr` stays valid for the life
    // of the `SampleBuffer`.
    unsafe impl Send for SampleBuffer {}
    // SAFETY: the producer writes only to indices in its own cursor's
    // advancing range and the consumer reads only indices already
    // covered by an acquire-observed `produced` store from that
    // producer, so the two threads never touch the same slot
    // concurrently.
    unsafe impl Sync for SampleBuffer {}

    impl SampleBuffer {
        pub fn new() -> Self {
            let mut storage = vec![0u16; MAX_DATA].into_boxed_slice();
            let ptr = storage.as_mut_ptr();
            SampleBuffer { storage, ptr }
        }

        /// Writes `samples` starting at index `pos` (mod `MAX_DATA`),
        /// wrapping at the end of the buffer.
        ///
        /// Producer-only: caller must ensure no other thread writes
        /// concurrently, which holds because `FastAcquirer` only ever
        /// calls this from its single producer thread.
        pub fn write_at(&self, pos: usize, samples: &[u16]) {
            let first_len = samples.len().min(MAX_DATA - pos);
            // SAFETY: pos < MAX_DATA and first_len <= MAX_DATA - pos, so
            // `ptr.add(pos)` through `ptr.add(pos + first_len)` stays
            // within the `MAX_DATA`-element allocation.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    samples.as_ptr(),
                    self.ptr.add(pos),
                    first_len,
                );
            }
            if first_len < samples.len() {
                let rest = &samples[first_len..];
                // SAFETY: rest.len() == samples.len() - first_len <=
                // MAX_DATA - (MAX_DATA - pos) - ... always < MAX_DATA,
                // the wrapped write starts at offset 0.
                unsafe {
                    std::ptr::copy_nonoverlapping(rest.as_ptr(), self.ptr, rest.len());
                }
            }
        }

        /// Reads `count` samples starting at index `start` (mod
        /// `MAX_DATA`) into `out`, wrapping at the end of the buffer.
        ///
        /// Consumer-only: every index read here must already have been
        /// published by the producer's release-ordered `produced`
        /// store, which the caller guarantees by bounding `count` to
        /// `produced - consumed`.
        pub fn read_into(&self, start: usize, count: usize, out: &mut Vec<i32>) {
            let first_len = count.min(MAX_DATA - start);
            // SAFETY: see `write_at`; the consumer never reads a slot
            // the producer hasn't finished writing, by the acquire load
            // of `produced` preceding this call.
            let first = unsafe { std::slice::from_raw_parts(self.ptr.add(start), first_len) };
            out.extend(first.iter().map(|&v| v as i32));
            if first_len < count {
                let rest_len = count - first_len;
                // SAFETY: wrapped portion starts at offset 0, rest_len < MAX_DATA.
                let rest = unsafe { std::slice::from_raw_parts(self.ptr, rest_len) };
                out.extend(rest.iter().map(|&v| v as i32));
            }
        }
    }
}
use ring::SampleBuffer;

use tracing::{info, warn};

use crate::error::{DaqError, DaqResult};
use crate::pulse_detector::PulseDetector;

/// Target fast-ADC sample rate (`util_mccdaq.c`: `FREQUENCY`).
pub const FREQUENCY_HZ: u32 = 499_999;
/// USB bulk-transfer request size cap, bytes (`util_mccdaq.c`: `MAX_LENGTH`).
pub const MAX_LENGTH: usize = 20_000;
/// Circular sample buffer capacity, cells (`util_mccdaq.c`: `MAX_DATA`,
/// 20 seconds of data).
pub const MAX_DATA: usize = 20 * 500_000;
/// Consumer backlog threshold (one second's worth) past which samples
/// are discarded rather than processed (spec.md §4.3).
pub const BACKLOG_DISCARD_THRESHOLD: u64 = 500_000;
/// USB device class max-packet-size quirk: transfers that are an exact
/// multiple of this also drain a trailing 2-byte zero-length packet.
pub const USB_MAX_PACKET_SIZE: usize = 64;

/// Result of one bulk-transfer attempt against the USB device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Number of 16-bit samples actually transferred.
    pub samples: usize,
    /// Whether the device reported its scan as still running.
    pub scan_running: bool,
    /// Whether the transfer itself errored (pipe stall or otherwise).
    pub errored: bool,
}

/// The out-of-scope USB driver SDK collaborator (spec.md §1), modeled
/// as a trait so `FastAcquirer` can drive either a real device binding
/// or [`SimulatedFastAdc`].
pub trait FastAdcDevice: Send {
    /// Requests up to `buf.len()` samples; fills `buf` and returns the
    /// outcome. Blocks up to the device's own transfer timeout.
    fn bulk_transfer(&mut self, buf: &mut [u16]) -> TransferOutcome;
    /// Clears a halted endpoint and restarts the analog input scan at
    /// {channel 0, `FREQUENCY_HZ`}.
    fn restart_scan(&mut self);
    /// Drains the class-quirk trailing zero-length packet.
    fn drain_zero_length_packet(&mut self) {}
}

/// Fast-ADC simulation, generalized from `util_mccdaq.c`'s `#ifdef
/// MCCDAQ_TEST` branch: a baseline that ramps by ±1 around 2048, with
/// a few counts of `rand`-driven jitter layered on top (the donor's
/// own mock-data-generation role for this crate; `util_mccdaq.c`'s
/// sim itself is bit-exact and deterministic, which made every
/// injected pulse identical run to run) and periodic injected pulses.
/// Used by tests and the `-t` synthetic log-file generator.
pub struct SimulatedFastAdc {
    value: i32,
    rising: bool,
    count: u64,
    rng: rand::rngs::StdRng,
}

impl Default for SimulatedFastAdc {
    fn default() -> Self {
        use rand::SeedableRng;
        SimulatedFastAdc {
            value: 2048,
            rising: true,
            count: 0,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }
}

impl FastAdcDevice for SimulatedFastAdc {
    fn bulk_transfer(&mut self, buf: &mut [u16]) -> TransferOutcome {
        use rand::Rng;
        for slot in buf.iter_mut() {
            let jitter = self.rng.gen_range(-2..=2);
            *slot = (self.value + jitter).clamp(0, 4095) as u16;
            if self.count % 25 == 24 {
                if self.rising {
                    self.value += 1;
                } else {
                    self.value -= 1;
                }
            }
            self.count += 1;
        }
        // Every 25th transfer, inject a short pulse near the start.
        if buf.len() > 3 && self.count % 25 == 0 {
            buf[0] = 3000;
            buf[1] = 2600;
            buf[2] = 2150;
            buf[3] = 2300;
        }
        TransferOutcome {
            samples: buf.len(),
            scan_running: true,
            errored: false,
        }
    }

    fn restart_scan(&mut self) {
        self.value = 2048;
        self.rising = true;
    }
}

/// Lifecycle state, per spec.md §4.3's `{NOT_INITIALIZED → STOPPED →
/// RUNNING → STOPPING → STOPPED}` machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastAcquirerState {
    /// `new()` has not yet been paired with a `start()`.
    NotInitialized,
    /// Idle; `start()` is accepted from this state only.
    Stopped,
    /// Producer and consumer threads are running.
    Running,
    /// `stop()` has been requested; threads are cooperatively winding down.
    Stopping,
}

/// Producer/consumer pair over a [`FastAdcDevice`], feeding a
/// [`PulseDetector`] shared behind a mutex (only the consumer ever
/// calls into it, but the mutex lets `end_of_second` be driven from
/// the Fuser's own thread without unsafe aliasing).
pub struct FastAcquirer {
    state: Arc<Mutex<FastAcquirerState>>,
    produced: Arc<AtomicU64>,
    restart_count: Arc<AtomicUsize>,
    detector: Arc<Mutex<PulseDetector>>,
    producer_handle: Option<JoinHandle<()>>,
    consumer_handle: Option<JoinHandle<()>>,
}

impl FastAcquirer {
    /// Creates an acquirer in the `Stopped` state, ready for `start()`.
    pub fn new() -> Self {
        FastAcquirer {
            state: Arc::new(Mutex::new(FastAcquirerState::Stopped)),
            produced: Arc::new(AtomicU64::new(0)),
            restart_count: Arc::new(AtomicUsize::new(0)),
            detector: Arc::new(Mutex::new(PulseDetector::new())),
            producer_handle: None,
            consumer_handle: None,
        }
    }

    /// Shared handle to the detector, for the Fuser to call
    /// `end_of_second` on at the wall-clock second boundary.
    pub fn detector(&self) -> Arc<Mutex<PulseDetector>> {
        Arc::clone(&self.detector)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FastAcquirerState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// Total USB restart count observed since the last call (the
    /// counter is reset to zero on read, mirroring
    /// `mccdaq_get_restart_count`'s read-and-clear semantics).
    pub fn take_restart_count(&self) -> usize {
        self.restart_count.swap(0, Ordering::Relaxed)
    }

    /// Starts the producer/consumer threads against `device`.
    ///
    /// Rejects (`DaqError::UsbTransfer`) unless currently `Stopped`.
    pub fn start(&mut self, device: Box<dyn FastAdcDevice>) -> DaqResult<()> {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state != FastAcquirerState::Stopped {
                return Err(DaqError::UsbTransfer(format!(
                    "start() rejected from state {:?}",
                    *state
                )));
            }
            *state = FastAcquirerState::Running;
        }
        info!("FastAcquirer starting");

        let buffer = Arc::new(SampleBuffer::new());
        let write_cursor = Arc::new(AtomicU64::new(0));

        let producer_state = Arc::clone(&self.state);
        let producer_produced = Arc::clone(&self.produced);
        let producer_restart_count = Arc::clone(&self.restart_count);
        let producer_buffer = Arc::clone(&buffer);
        let producer_cursor = Arc::clone(&write_cursor);
        self.producer_handle = Some(std::thread::spawn(move || {
            Self::producer_loop(
                producer_state,
                producer_produced,
                producer_restart_count,
                producer_buffer,
                producer_cursor,
                device,
            );
        }));

        let consumer_state = Arc::clone(&self.state);
        let consumer_produced = Arc::clone(&self.produced);
        let consumer_buffer = Arc::clone(&buffer);
        let consumer_detector = Arc::clone(&self.detector);
        self.consumer_handle = Some(std::thread::spawn(move || {
            Self::consumer_loop(consumer_state, consumer_produced, consumer_buffer, consumer_detector);
        }));

        Ok(())
    }

    fn producer_loop(
        state: Arc<Mutex<FastAcquirerState>>,
        produced: Arc<AtomicU64>,
        restart_count: Arc<AtomicUsize>,
        buffer: Arc<SampleBuffer>,
        cursor: Arc<AtomicU64>,
        mut device: Box<dyn FastAdcDevice>,
    ) {
        let mut scratch = vec![0u16; MAX_LENGTH / 2];
        loop {
            if *state.lock().expect("state mutex poisoned") == FastAcquirerState::Stopping {
                break;
            }

            let pos = (cursor.load(Ordering::Relaxed) % MAX_DATA as u64) as usize;
            let avail = MAX_DATA - pos;
            let request_len = avail.min(scratch.len());

            let outcome = device.bulk_transfer(&mut scratch[..request_len]);

            if request_len * 2 % USB_MAX_PACKET_SIZE == 0 {
                device.drain_zero_length_packet();
            }

            if outcome.errored || !outcome.scan_running {
                device.restart_scan();
                restart_count.fetch_add(1, Ordering::Relaxed);
            }

            if outcome.samples > 0 {
                buffer.write_at(pos, &scratch[..outcome.samples]);
                cursor.fetch_add(outcome.samples as u64, Ordering::Relaxed);
                produced.fetch_add(outcome.samples as u64, Ordering::Release);
            }
        }
    }

    fn consumer_loop(
        state: Arc<Mutex<FastAcquirerState>>,
        produced: Arc<AtomicU64>,
        buffer: Arc<SampleBuffer>,
        detector: Arc<Mutex<PulseDetector>>,
    ) {
        let mut consumed: u64 = 0;
        let mut scratch: Vec<i32> = Vec::new();
        loop {
            if *state.lock().expect("state mutex poisoned") == FastAcquirerState::Stopping {
                break;
            }

            let total_produced = produced.load(Ordering::Acquire);
            if total_produced == consumed {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            if total_produced - consumed > BACKLOG_DISCARD_THRESHOLD {
                warn!(
                    backlog = total_produced - consumed,
                    "fast ADC consumer falling behind, discarding samples"
                );
                consumed = total_produced;
                continue;
            }

            let count = (total_produced - consumed) as usize;
            let start = (consumed % MAX_DATA as u64) as usize;
            scratch.clear();
            buffer.read_into(start, count, &mut scratch);
            let mut det = detector.lock().expect("detector mutex poisoned");
            for &raw in &scratch {
                det.push_sample(raw);
            }
            drop(det);
            consumed = total_produced;
        }
    }

    /// Transitions to `Stopping` and joins both threads, per spec.md
    /// §5's 5 s join budget (cooperative: producer checks on every
    /// outer iteration, consumer on every inner one).
    pub fn stop(&mut self) {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state != FastAcquirerState::Running {
                return;
            }
            *state = FastAcquirerState::Stopping;
        }
        if let Some(h) = self.producer_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.consumer_handle.take() {
            let _ = h.join();
        }
        *self.state.lock().expect("state mutex poisoned") = FastAcquirerState::Stopped;
        info!("FastAcquirer stopped");
    }
}

impl Default for FastAcquirer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FastAcquirer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_adc_produces_samples_near_baseline() {
        let mut sim = SimulatedFastAdc::default();
        let mut buf = vec![0u16; 1000];
        let outcome = sim.bulk_transfer(&mut buf);
        assert_eq!(outcome.samples, 1000);
        assert!(outcome.scan_running);
        assert!(buf.iter().all(|&v| (2000..=2100).contains(&v)) || buf[0] == 3000);
    }

    #[test]
    fn start_rejected_unless_stopped() {
        let mut acquirer = FastAcquirer::new();
        acquirer
            .start(Box::new(SimulatedFastAdc::default()))
            .unwrap();
        let err = acquirer.start(Box::new(SimulatedFastAdc::default()));
        assert!(err.is_err());
        acquirer.stop();
    }

    #[test]
    fn stop_joins_threads_and_returns_to_stopped() {
        let mut acquirer = FastAcquirer::new();
        acquirer
            .start(Box::new(SimulatedFastAdc::default()))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        acquirer.stop();
        assert_eq!(acquirer.state(), FastAcquirerState::Stopped);
    }

    #[test]
    fn sample_buffer_wraps_writes_and_reads_at_the_boundary() {
        let buf = SampleBuffer::new();
        let pos = MAX_DATA - 2;
        buf.write_at(pos, &[10, 20, 30, 40]);

        let mut out = Vec::new();
        buf.read_into(pos, 4, &mut out);
        assert_eq!(out, vec![10, 20, 30, 40]);

        // The wrapped pair landed at the front of the buffer.
        let mut front = Vec::new();
        buf.read_into(0, 2, &mut front);
        assert_eq!(front, vec![30, 40]);
    }

    #[test]
    fn running_acquirer_feeds_pulse_detector() {
        let mut acquirer = FastAcquirer::new();
        let detector = acquirer.detector();
        acquirer
            .start(Box::new(SimulatedFastAdc::default()))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        acquirer.stop();
        let counts = detector.lock().unwrap().end_of_second();
        assert_eq!(counts.len(), crate::record::MAX_CHANNEL);
    }
}
