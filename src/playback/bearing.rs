//! Bearing sources feeding the playback driver

use crate::error::{AaremuError, Result};
use crate::store::normalize_bearing;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One orientation reading: compass bearing plus the time it was taken
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BearingReading {
    /// Degrees [0, 360)
    pub bearing: f32,
    /// Milliseconds, in the provider's clock
    pub timestamp: i64,
}

/// Something the playback driver can ask for the current bearing
pub trait BearingSource: Send + Sync {
    /// Latest reading, or `None` if no bearing is available yet
    fn reading(&self) -> Option<BearingReading>;
}

impl<T: BearingSource + ?Sized> BearingSource for Arc<T> {
    fn reading(&self) -> Option<BearingReading> {
        (**self).reading()
    }
}

/// Latest bearing pushed by an orientation provider
///
/// Stored as f32 bits in an atomic for lock-free sharing between the
/// sensor callback thread and the playback thread. NaN means "no reading".
pub struct SharedBearing {
    bits: AtomicU32,
    timestamp: AtomicI64,
}

impl SharedBearing {
    /// Create with no reading
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(f32::NAN.to_bits()),
            timestamp: AtomicI64::new(0),
        }
    }

    /// Publish a new bearing (normalized into [0, 360))
    pub fn set(&self, bearing: f32, timestamp: i64) {
        self.timestamp.store(timestamp, Ordering::Relaxed);
        self.bits
            .store(normalize_bearing(bearing).to_bits(), Ordering::Release);
    }

    /// Forget the current reading
    pub fn clear(&self) {
        self.bits.store(f32::NAN.to_bits(), Ordering::Release);
    }

    /// Get the current bearing, if any
    pub fn get(&self) -> Option<f32> {
        let bearing = f32::from_bits(self.bits.load(Ordering::Acquire));
        (!bearing.is_nan()).then_some(bearing)
    }
}

impl Default for SharedBearing {
    fn default() -> Self {
        Self::new()
    }
}

impl BearingSource for SharedBearing {
    fn reading(&self) -> Option<BearingReading> {
        let bearing = self.get()?;
        Some(BearingReading {
            bearing,
            timestamp: self.timestamp.load(Ordering::Relaxed),
        })
    }
}

/// Scripted sweep over a bearing range, for reviewing a recording without a sensor
///
/// Walks from `start` towards `end` one `step` per `dwell`. With `repeat`
/// it then walks back from `end` to `start` and keeps bouncing; without,
/// it reports no bearing once the forward pass is done.
pub struct ReviewSweep {
    start: f32,
    step: f32,
    /// Number of steps from start to end
    steps: u32,
    span: f32,
    dwell: Duration,
    repeat: bool,
    started: Instant,
}

impl ReviewSweep {
    /// Create a sweep; a range with `start == end` covers the full circle
    pub fn new(start: f32, end: f32, step: f32, dwell: Duration, repeat: bool) -> Result<Self> {
        if !step.is_finite() || step <= 0.0 {
            return Err(AaremuError::InvalidConfig(format!(
                "sweep step must be positive, got {}",
                step
            )));
        }
        if dwell.is_zero() {
            return Err(AaremuError::InvalidConfig("sweep dwell must be non-zero".into()));
        }

        let start = normalize_bearing(start);
        let mut span = (normalize_bearing(end) - start).rem_euclid(360.0);
        if span == 0.0 {
            span = 360.0;
        }
        let steps = (span / step).ceil().max(1.0) as u32;

        Ok(Self {
            start,
            step,
            steps,
            span,
            dwell,
            repeat,
            started: Instant::now(),
        })
    }

    /// Full-circle sweep starting at north
    pub fn full_circle(step: f32, dwell: Duration, repeat: bool) -> Result<Self> {
        Self::new(0.0, 0.0, step, dwell, repeat)
    }

    /// Restart the sweep from its first position
    pub fn restart(&mut self) {
        self.started = Instant::now();
    }

    /// Bearing at position `i` (0 = start, `steps` = end)
    fn position(&self, i: u32) -> f32 {
        let offset = (i as f32 * self.step).min(self.span);
        normalize_bearing(self.start + offset)
    }

    /// Bearing after `elapsed`, or `None` once a non-repeating sweep is done
    pub fn bearing_at(&self, elapsed: Duration) -> Option<f32> {
        let tick = (elapsed.as_nanos() / self.dwell.as_nanos().max(1)) as u64;
        let steps = self.steps as u64;

        if !self.repeat {
            // Forward pass visits start .. end, excluding end
            return (tick < steps).then(|| self.position(tick as u32));
        }

        // Forward start..end (exclusive), then back end..start (inclusive)
        let cycle = 2 * steps + 1;
        let t = tick % cycle;
        let i = if t < steps { t } else { cycle - 1 - t };
        Some(self.position(i as u32))
    }

    /// Check if a non-repeating sweep has finished
    pub fn is_complete(&self) -> bool {
        self.bearing_at(self.started.elapsed()).is_none()
    }
}

impl BearingSource for ReviewSweep {
    fn reading(&self) -> Option<BearingReading> {
        let elapsed = self.started.elapsed();
        let bearing = self.bearing_at(elapsed)?;
        Some(BearingReading {
            bearing,
            timestamp: elapsed.as_millis() as i64,
        })
    }
}
