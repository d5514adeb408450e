//! Fixed-capacity bearing-bucket index over the backing file

use crate::error::{AaremuError, Result};
use crate::store::{normalize_bearing, FrameRef};
use parking_lot::Mutex;

/// Circular index mapping quantized bearing buckets to frame locations
///
/// Shared between the writer thread (puts) and at most one playback reader.
/// All access goes through a single mutex.
pub struct RingIndex {
    bucket_width: f32,
    bucket_count: usize,
    slots: Mutex<Vec<Option<FrameRef>>>,
}

/// A run of consecutive empty buckets, possibly wrapping past 360
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    /// First bucket of the run
    pub start: usize,
    /// Number of buckets in the run
    pub len: usize,
}

/// Finest supported resolution: a thousandth of a degree
pub const MAX_BUCKET_COUNT: usize = 360 * 1000;

impl RingIndex {
    /// Create an index with `round(360 / bucket_width)` buckets
    pub fn new(bucket_width: f32) -> Result<Self> {
        if !bucket_width.is_finite() || bucket_width <= 0.0 || bucket_width > 360.0 {
            return Err(AaremuError::InvalidConfig(format!(
                "bucket width must be in (0, 360], got {}",
                bucket_width
            )));
        }
        let buckets = (360.0 / bucket_width).round();
        if buckets > MAX_BUCKET_COUNT as f32 {
            return Err(AaremuError::InvalidConfig(format!(
                "bucket width {} gives more than {} buckets",
                bucket_width, MAX_BUCKET_COUNT
            )));
        }
        let bucket_count = (buckets as usize).max(1);

        Ok(Self {
            bucket_width,
            bucket_count,
            slots: Mutex::new(vec![None; bucket_count]),
        })
    }

    /// Get the bucket width in degrees
    pub fn bucket_width(&self) -> f32 {
        self.bucket_width
    }

    /// Get the fixed number of buckets
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Bucket a bearing falls into
    pub fn bucket_for(&self, bearing: f32) -> usize {
        let b = normalize_bearing(bearing);
        ((b / self.bucket_width).round() as usize) % self.bucket_count
    }

    /// Bearing at the centre of a bucket
    pub fn bucket_center(&self, bucket: usize) -> f32 {
        (bucket % self.bucket_count) as f32 * self.bucket_width
    }

    /// Store a frame under its bearing's bucket
    ///
    /// Returns the frame that was replaced, if any.
    pub fn put(&self, bearing: f32, frame: FrameRef) -> Option<FrameRef> {
        let bucket = self.bucket_for(bearing);
        self.put_bucket(bucket, frame)
    }

    /// Store a frame directly into a bucket slot
    pub fn put_bucket(&self, bucket: usize, frame: FrameRef) -> Option<FrameRef> {
        let bucket = bucket % self.bucket_count;
        self.slots.lock()[bucket].replace(frame)
    }

    /// Get the frame stored for a bearing's bucket
    pub fn get(&self, bearing: f32) -> Result<FrameRef> {
        self.get_bucket(self.bucket_for(bearing))
            .ok_or(AaremuError::NotFound)
    }

    /// Get the frame stored in a bucket slot
    pub fn get_bucket(&self, bucket: usize) -> Option<FrameRef> {
        self.slots.lock()[bucket % self.bucket_count]
    }

    /// Clear the slot for a bearing's bucket
    pub fn remove(&self, bearing: f32) -> Option<FrameRef> {
        let bucket = self.bucket_for(bearing);
        self.slots.lock()[bucket].take()
    }

    /// Clear all slots
    pub fn clear(&self) {
        self.slots.lock().iter_mut().for_each(|slot| *slot = None);
    }

    /// Number of populated buckets
    pub fn populated(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Check if no bucket is populated
    pub fn is_empty(&self) -> bool {
        self.slots.lock().iter().all(|s| s.is_none())
    }

    /// Populated buckets with their frames, in bucket order
    pub fn entries(&self) -> Vec<(usize, FrameRef)> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|f| (i, f)))
            .collect()
    }

    /// Run a closure over the slot table while holding the lock
    pub fn with_slots<R>(&self, f: impl FnOnce(&[Option<FrameRef>]) -> R) -> R {
        let slots = self.slots.lock();
        f(&slots)
    }

    /// Runs of empty buckets (areas never swept)
    ///
    /// A run crossing bucket 0 is reported once, starting at its
    /// highest-numbered bucket.
    pub fn gaps(&self) -> Vec<BucketRange> {
        let slots = self.slots.lock();
        let n = slots.len();

        let Some(anchor) = slots.iter().position(|s| s.is_some()) else {
            return vec![BucketRange { start: 0, len: n }];
        };

        // Walk once around the circle starting at a populated bucket so a
        // wrapping run is never split.
        let mut gaps = Vec::new();
        let mut run: Option<BucketRange> = None;
        for step in 1..=n {
            let i = (anchor + step) % n;
            if slots[i].is_none() {
                match run.as_mut() {
                    Some(r) => r.len += 1,
                    None => run = Some(BucketRange { start: i, len: 1 }),
                }
            } else if let Some(r) = run.take() {
                gaps.push(r);
            }
        }
        gaps.sort_by_key(|r| r.start);
        gaps
    }
}
