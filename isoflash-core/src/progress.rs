//! Best-effort progress reporting.
//!
//! Platform tools report progress as free-form text, if at all. This module
//! turns that text (or, failing that, the elapsed time) into typed
//! [`Progress`] events, keeping the percentages monotonic and below 100%
//! until the job has synced. Nothing here can fail a job: a line that does
//! not parse simply produces no update.

use std::fmt;
use std::time::Duration;

/// Reported when formatting starts.
pub const FORMAT_START: f64 = 10.0;
/// Reported when formatting finishes.
pub const FORMAT_DONE: f64 = 20.0;
/// Reported when the write phase starts.
pub const WRITE_START: f64 = 25.0;
/// Upper bound for byte-accurate write progress.
pub const WRITE_CAP: f64 = 90.0;
/// Upper bound for time-estimated write progress.
pub const ESTIMATE_CAP: f64 = 85.0;
/// Reported when the sync step starts.
pub const SYNC_START: f64 = 95.0;
/// Reported once the job has completed.
pub const COMPLETE: f64 = 100.0;

/// The phase of a job a [`Progress`] event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Formatting,
    Writing,
    Syncing,
    Done,
}

impl Stage {
    /// A short capitalized name, suitable as a progress bar prefix.
    pub fn title(&self) -> &'static str {
        match self {
            Stage::Formatting => "Formatting",
            Stage::Writing => "Flashing",
            Stage::Syncing => "Syncing",
            Stage::Done => "Done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Formatting => "formatting",
            Stage::Writing => "writing",
            Stage::Syncing => "syncing",
            Stage::Done => "finishing",
        };
        f.write_str(s)
    }
}

/// A single progress update for the job currently running.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub stage: Stage,
    /// Overall completion of the job in percent, `0.0..=100.0`.
    pub percent: f64,
    pub message: String,
}

impl Progress {
    pub fn new(stage: Stage, percent: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent,
            message: message.into(),
        }
    }
}

/// Extracts the byte count from a `dd` progress or summary line.
///
/// Both GNU (`123 bytes (123 B) copied, ...`) and BSD (`123 bytes transferred
/// in ...`) phrasings start with the count. Returns `None` for anything else.
pub fn parse_dd_bytes(line: &str) -> Option<u64> {
    let (head, _) = line.split_once("bytes")?;
    head.trim().parse().ok()
}

/// Maps partial completion of the write phase onto the overall percentage,
/// never going backwards and never passing its cap.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    start: f64,
    cap: f64,
    last: f64,
}

impl ProgressTracker {
    pub fn new(start: f64, cap: f64) -> Self {
        debug_assert!(start <= cap && cap < COMPLETE);
        Self {
            start,
            cap,
            last: start,
        }
    }

    /// The last percentage reported by this tracker.
    pub fn current(&self) -> f64 {
        self.last
    }

    /// Records that `fraction` (`0.0..=1.0`) of the phase is done. Returns the
    /// new overall percentage if it moved forward.
    pub fn fraction(&mut self, fraction: f64) -> Option<f64> {
        if !fraction.is_finite() {
            return None;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let percent = (self.start + fraction * (self.cap - self.start)).min(self.cap);
        if percent > self.last {
            self.last = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Records that `done` of `total` bytes have been transferred.
    pub fn bytes(&mut self, done: u64, total: u64) -> Option<f64> {
        if total == 0 {
            return self.fraction(1.0);
        }
        self.fraction(done as f64 / total as f64)
    }
}

/// A wall-clock estimate of the write phase for tools that print nothing
/// while they run.
///
/// The assumed throughput is a guess, not a measurement; the estimate only
/// promises to grow with time.
#[derive(Clone, Copy, Debug)]
pub struct ElapsedEstimate {
    expected: Duration,
}

impl ElapsedEstimate {
    /// Bytes per second assumed for a typical USB 2.0 stick.
    pub const ASSUMED_THROUGHPUT: u64 = 8 * 1024 * 1024;

    pub fn for_image(image_len: u64) -> Self {
        let secs = image_len as f64 / Self::ASSUMED_THROUGHPUT as f64;
        Self {
            expected: Duration::from_secs_f64(secs.max(1.0)),
        }
    }

    pub fn expected(&self) -> Duration {
        self.expected
    }

    /// The estimated completed fraction after `elapsed`, `0.0..=1.0`.
    pub fn fraction(&self, elapsed: Duration) -> f64 {
        (elapsed.as_secs_f64() / self.expected.as_secs_f64()).min(1.0)
    }
}
