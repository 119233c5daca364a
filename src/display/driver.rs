//! DisplayDriver: the LIVE/PLAYBACK cursor state machine, per spec.md
//! §4.9. Pixel rendering is out of scope; [`Renderer`] is the
//! `request_repaint`-style callback boundary an embedding GUI toolkit
//! implements, grounded on the same logical/concrete split the teacher
//! draws at `hardware/capabilities.rs`.

use std::time::Duration;

/// Which mode the cursor is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Cursor is pinned to `max - 1` and follows new records as they
    /// arrive.
    Live,
    /// Cursor is fixed at a user-chosen `file_idx`.
    Playback,
}

/// Step granularities for cursor movement, seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Plain arrow key: 1 s.
    Arrow,
    /// Ctrl + arrow: 10 s.
    Ctrl,
    /// Alt + arrow: 60 s.
    Alt,
}

impl Step {
    fn seconds(self) -> i64 {
        match self {
            Step::Arrow => 1,
            Step::Ctrl => 10,
            Step::Alt => 60,
        }
    }
}

/// Direction of a cursor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward lower indices / earlier time.
    Backward,
    /// Toward higher indices / later time.
    Forward,
}

/// Callback boundary an embedding GUI implements to receive repaint
/// requests. `request_repaint` may be called from any thread driving
/// the cursor (the live-acquisition thread advancing `max`, or the
/// main thread handling input) and must be safe to call cheaply and
/// repeatedly; typical implementations wake a blocked event loop.
pub trait Renderer {
    /// Requests that the embedding GUI repaint at its next opportunity.
    fn request_repaint(&self);
}

/// Pure state machine: cursor position, mode, and the transition rules
/// of spec.md §4.9. Does not own a [`crate::log_store::LogStore`]; the
/// caller supplies the current `max` on each call so the driver never
/// needs its own I/O.
pub struct DisplayDriver {
    mode: Mode,
    file_idx: u32,
    initially_live_mode: bool,
}

impl DisplayDriver {
    /// Starts in LIVE if `initially_live_mode`, else PLAYBACK at index 0.
    /// `initially_live_mode` is true for the no-`-p` (LIVE connection)
    /// invocation and false for `-p FILE` (pure playback).
    pub fn new(initially_live_mode: bool, max: u32) -> Self {
        let mode = if initially_live_mode {
            Mode::Live
        } else {
            Mode::Playback
        };
        let file_idx = max.saturating_sub(1);
        DisplayDriver {
            mode,
            file_idx,
            initially_live_mode,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current cursor position, always in `[0, max-1]` for the `max`
    /// most recently observed via [`Self::on_max_advanced`].
    pub fn file_idx(&self) -> u32 {
        self.file_idx
    }

    /// Called whenever the backing store's `max` advances (a new
    /// record was appended). In LIVE, pins the cursor to `max - 1`.
    pub fn on_max_advanced(&mut self, max: u32) {
        if self.mode == Mode::Live {
            self.file_idx = max.saturating_sub(1);
        }
    }

    /// Moves the cursor by `step` in `direction`, clamped to
    /// `[0, max-1]`. Any cursor move leaves LIVE (spec.md §4.9: "Any
    /// cursor move ⇒ PLAYBACK").
    pub fn step_cursor(&mut self, direction: Direction, step: Step, max: u32) {
        self.mode = Mode::Playback;
        let delta = step.seconds();
        let idx = self.file_idx as i64;
        let moved = match direction {
            Direction::Backward => idx - delta,
            Direction::Forward => idx + delta,
        };
        self.file_idx = moved.clamp(0, max.saturating_sub(1) as i64) as u32;
    }

    /// Home: cursor to the start of the file; always enters PLAYBACK.
    pub fn jump_home(&mut self) {
        self.mode = Mode::Playback;
        self.file_idx = 0;
    }

    /// End: cursor to the most recent record. Enters LIVE if
    /// `initially_live_mode`, else PLAYBACK at `max - 1` (spec.md
    /// §4.9).
    pub fn jump_end(&mut self, max: u32) {
        self.file_idx = max.saturating_sub(1);
        self.mode = if self.initially_live_mode {
            Mode::Live
        } else {
            Mode::Playback
        };
    }

    /// Called when the renderer reaches the right edge while in
    /// PLAYBACK. Enters LIVE only if `initially_live_mode` (spec.md
    /// §4.9's first transition rule).
    pub fn on_right_edge_reached(&mut self, max: u32) {
        if self.mode == Mode::Playback && self.initially_live_mode {
            self.mode = Mode::Live;
            self.file_idx = max.saturating_sub(1);
        }
    }
}

/// Reasons the rendering request loop may wake, per spec.md §4.9's
/// "block until any of {...}" wake-condition set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The application is shutting down.
    Quit,
    /// A user-visible banner (LOST_CONN/FILE_ERROR/TIME_ERROR/
    /// SCREENSHOT) appeared or cleared.
    MessageStateChanged,
    /// The queued input events were fully drained and `file_idx`
    /// changed as a result.
    CursorMoved,
    /// The backing store's `max` advanced.
    MaxAdvanced,
}

/// Blocks the calling thread until one of the wake conditions fires or
/// `timeout` elapses, whichever comes first — avoids busy-waiting
/// while still observing newly-arrived live data. Implemented in terms
/// of a condition variable owned by the caller; this free function
/// documents the wait contract spec.md §4.9 describes, callers
/// typically pair it with their own `Condvar`/`Mutex` pair.
pub fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}
