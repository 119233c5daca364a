//! Crate-wide error taxonomy.
//!
//! # Error Hierarchy
//!
//! Errors are classified per the four failure tiers described in the
//! design notes: *transient* conditions are retried at the point of
//! occurrence and never constructed as a [`DaqError`] at all; *degraded*
//! conditions are surfaced through observable state (`scan_okay`,
//! [`crate::record::GaugeReading`]) rather than propagated as errors;
//! *fatal* conditions (at init or at steady state) are returned here,
//! logged, and translated into a nonzero process exit code by `main`;
//! the time-error condition is terminal for the live-acquisition thread
//! only and is represented by [`DaqError::TimeDrift`].

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type DaqResult<T> = Result<T, DaqError>;

/// Everything that can go fatally wrong in this crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Wraps any I/O failure (file, socket, serial port) that isn't
    /// more specifically classified below.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings failed to load or parse.
    #[error("configuration error: {0}")]
    Config(String),

    /// A settings value failed its range/sanity check.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// SerialAcquirer was asked to operate before a successful `init()`.
    #[error("serial port not connected")]
    SerialPortNotConnected,

    /// The serial framing sync bit was set where it should be clear
    /// (or vice versa); per spec this aborts the reader thread.
    #[error("serial ADC lost frame sync")]
    SerialLostSync,

    /// `dataq`-style command echo didn't match what was sent.
    #[error("serial ADC command `{0}` was not acknowledged")]
    SerialCommandNotAcked(String),

    /// Draining a prior session, or waiting for an init response,
    /// exceeded its timeout.
    #[error("serial ADC init timed out waiting for `{0}`")]
    SerialInitTimeout(String),

    /// A USB bulk transfer failed in a way the restart policy could
    /// not recover from (device gone, not just a pipe stall).
    #[error("USB transfer error: {0}")]
    UsbTransfer(String),

    /// CameraAcquirer's buffer-drain poll exceeded its 2s timeout.
    #[error("camera not responding")]
    CameraTimeout,

    /// LogStore detected a magic mismatch on read; the file is corrupt.
    #[error("log file corrupt: {0}")]
    LogFileCorrupt(String),

    /// Recorder's Part1 region is full (`max >= MAX_FILE_DATA_PART1`).
    #[error("log file is full")]
    LogFileFull,

    /// `LogStore::create` was asked to create a file that already exists.
    #[error("log file already exists: {0}")]
    LogFileExists(String),

    /// Recorder observed a new record whose time was not exactly
    /// `last_time + 1`; this is a programming-invariant violation once
    /// Recorder is in steady state (gaps are filled, never skipped).
    #[error("time sequence violation: expected {expected}, got {got}")]
    TimeSequenceViolation {
        /// The time the next record was required to carry.
        expected: i64,
        /// The time the next record actually carried.
        got: i64,
    },

    /// A decoded wire or file record carried the wrong magic.
    #[error("magic mismatch: expected {expected:#x}, got {got:#x}")]
    ProtocolMagicMismatch {
        /// Expected magic value.
        expected: u64,
        /// Magic value actually read.
        got: u64,
    },

    /// A decode operation ran past the bytes available.
    #[error("truncated data: needed {needed} bytes, had {available}")]
    Truncated {
        /// Bytes required to complete the decode.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The server connection dropped; the client will reconnect.
    #[error("connection lost: {0}")]
    ConnectionLost(std::io::Error),

    /// Server and client wall clocks disagree by more than the 5s
    /// bound; this is terminal for the live-acquisition thread.
    #[error("time drift of {delta_secs}s exceeds bound")]
    TimeDrift {
        /// Absolute difference between server and local time, seconds.
        delta_secs: i64,
    },

    /// `SampleRing::stats`/`tail` called before the producer declared
    /// `scan_okay`.
    #[error("sample ring unavailable: producer has not declared scan_okay")]
    Unavailable,

    /// `SampleRing::tail` called with an out-of-range count.
    #[error("tail length {0} out of range")]
    OutOfRange(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: DaqError = io_err.into();
        assert!(matches!(err, DaqError::Io(_)));
    }

    #[test]
    fn display_messages_are_readable() {
        let err = DaqError::TimeSequenceViolation {
            expected: 101,
            got: 103,
        };
        assert_eq!(
            err.to_string(),
            "time sequence violation: expected 101, got 103"
        );
    }
}
