//! Playback tick pacing: fixed frame rate or recorded frame deltas

use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Interval used when a recording has too few frames to derive one
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// How ticks are spaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval derived from a target frame rate
    Fixed(Duration),
    /// Follow recorded timestamps
    Recorded {
        /// Interval used when no per-frame delta applies (bearing-keyed playback)
        mean: Duration,
        /// Longest wait honoured between two recorded frames
        max_delay: Duration,
    },
}

impl Cadence {
    /// Fixed cadence for `fps > 0`, recorded cadence otherwise
    pub fn from_fps(fps: i32, recorded_mean: Option<Duration>, max_delay: Duration) -> Self {
        if fps > 0 {
            Cadence::Fixed(Duration::from_secs(1) / fps as u32)
        } else {
            Cadence::Recorded {
                mean: recorded_mean.unwrap_or(DEFAULT_FRAME_INTERVAL),
                max_delay,
            }
        }
    }

    /// Interval between ticks when frames are not served in recorded order
    pub fn tick_interval(&self) -> Duration {
        match self {
            Cadence::Fixed(interval) => *interval,
            Cadence::Recorded { mean, .. } => *mean,
        }
    }

    /// Wait between serving a frame recorded at `previous` and one recorded at `next`
    pub fn frame_interval(&self, previous: Option<i64>, next: i64) -> Duration {
        match self {
            Cadence::Fixed(interval) => *interval,
            Cadence::Recorded { max_delay, .. } => match previous {
                // Out-of-order or duplicate timestamps play back-to-back
                Some(prev) if next > prev => {
                    Duration::from_millis((next - prev) as u64).min(*max_delay)
                }
                _ => Duration::ZERO,
            },
        }
    }
}

/// Deadline tracker for the playback loop
pub struct Pacer {
    cadence: Cadence,
    deadline: Instant,
}

impl Pacer {
    /// Create a pacer whose first tick is due immediately
    pub fn new(cadence: Cadence) -> Self {
        Self {
            cadence,
            deadline: Instant::now(),
        }
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    /// Time left until the next tick is due
    pub fn time_until_tick(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Schedule the next tick `interval` after the previous deadline
    ///
    /// Deadlines advance from the previous deadline rather than from now so
    /// the average rate holds. When the loop has fallen more than one
    /// interval behind (slow callback, long pause) it catches up instead of
    /// firing a burst of late ticks.
    pub fn schedule(&mut self, interval: Duration) {
        let now = Instant::now();
        let next = self.deadline + interval;
        if next + interval < now {
            debug!(
                "Playback {:?} behind schedule, catching up",
                now.duration_since(next)
            );
            self.deadline = now + interval;
        } else {
            self.deadline = next;
        }
        trace!("Next tick in {:?}", self.time_until_tick());
    }

    /// Make the next tick due now (after resume)
    pub fn reset(&mut self) {
        self.deadline = Instant::now();
    }
}
