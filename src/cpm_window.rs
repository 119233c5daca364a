//! CpmWindow: moving-average windows over per-second bucketed pulse
//! counts, per spec.md §3/§4.2.

use crate::record::MAX_CHANNEL;

/// A ring of the last `capacity` one-second bucket counts for every
/// detector channel, exposing a moving-average counts-per-second.
#[derive(Debug, Clone)]
pub struct CpmWindow {
    capacity: usize,
    buckets: Vec<[u32; MAX_CHANNEL]>,
    write_idx: usize,
    filled: usize,
    totals: [u64; MAX_CHANNEL],
}

impl CpmWindow {
    /// Creates a window covering `capacity` one-second buckets.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "CpmWindow capacity must be nonzero");
        CpmWindow {
            capacity,
            buckets: vec![[0; MAX_CHANNEL]; capacity],
            write_idx: 0,
            filled: 0,
            totals: [0; MAX_CHANNEL],
        }
    }

    /// Pushes one second's worth of per-channel pulse counts,
    /// evicting the oldest bucket once the window is full.
    pub fn push_second(&mut self, counts: [u32; MAX_CHANNEL]) {
        if self.filled == self.capacity {
            let evicted = self.buckets[self.write_idx];
            for c in 0..MAX_CHANNEL {
                self.totals[c] -= evicted[c] as u64;
            }
        } else {
            self.filled += 1;
        }
        for c in 0..MAX_CHANNEL {
            self.totals[c] += counts[c] as u64;
        }
        self.buckets[self.write_idx] = counts;
        self.write_idx = (self.write_idx + 1) % self.capacity;
    }

    /// Snapshot of the moving average, counts/sec, per channel, over
    /// however many seconds have actually been accumulated so far
    /// (i.e. divided by `filled`, not `capacity`, so a freshly-started
    /// window doesn't understate the rate).
    pub fn snapshot(&self) -> [f32; MAX_CHANNEL] {
        let mut out = [0.0f32; MAX_CHANNEL];
        if self.filled == 0 {
            return out;
        }
        for c in 0..MAX_CHANNEL {
            out[c] = self.totals[c] as f32 / self.filled as f32;
        }
        out
    }
}

/// One [`CpmWindow`] per configured window size, in the fixed order
/// the wire/file format expects ([`crate::record::CPM_WINDOWS_SEC`]).
#[derive(Debug, Clone)]
pub struct CpmWindows {
    windows: Vec<CpmWindow>,
}

impl CpmWindows {
    /// Builds one window per entry in `window_sizes_sec`.
    pub fn new(window_sizes_sec: &[u32]) -> Self {
        CpmWindows {
            windows: window_sizes_sec
                .iter()
                .map(|&secs| CpmWindow::new(secs as usize))
                .collect(),
        }
    }

    /// Feeds one second's counts into every window.
    pub fn push_second(&mut self, counts: [u32; MAX_CHANNEL]) {
        for window in &mut self.windows {
            window.push_second(counts);
        }
    }

    /// Snapshots every window's moving average, in window order.
    pub fn snapshot_all(&self) -> Vec<[f32; MAX_CHANNEL]> {
        self.windows.iter().map(CpmWindow::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(first: u32) -> [u32; MAX_CHANNEL] {
        let mut c = [0; MAX_CHANNEL];
        c[0] = first;
        c
    }

    #[test]
    fn moving_average_over_short_window() {
        let mut window = CpmWindow::new(2);
        window.push_second(counts(10));
        window.push_second(counts(20));
        let snap = window.snapshot();
        assert!((snap[0] - 15.0).abs() < 1e-6);
    }

    #[test]
    fn eviction_drops_oldest_bucket() {
        let mut window = CpmWindow::new(2);
        window.push_second(counts(10));
        window.push_second(counts(20));
        window.push_second(counts(30));
        // window now holds {20,30}; mean = 25.
        let snap = window.snapshot();
        assert!((snap[0] - 25.0).abs() < 1e-6);
    }

    #[test]
    fn fresh_window_averages_over_filled_not_capacity() {
        let mut window = CpmWindow::new(60);
        window.push_second(counts(60));
        let snap = window.snapshot();
        assert!((snap[0] - 60.0).abs() < 1e-6);
    }

    #[test]
    fn cpm_windows_tracks_all_sizes() {
        let mut windows = CpmWindows::new(&[1, 10]);
        windows.push_second(counts(5));
        let snaps = windows.snapshot_all();
        assert_eq!(snaps.len(), 2);
        assert!((snaps[0][0] - 5.0).abs() < 1e-6);
        assert!((snaps[1][0] - 5.0).abs() < 1e-6);
    }
}
