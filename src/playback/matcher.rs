//! Nearest-bearing lookup over the bucket index

use crate::error::{AaremuError, Result};
use crate::store::{angular_distance, normalize_bearing, FrameRef, RingIndex};
use std::sync::Arc;
use tracing::trace;

/// Distances closer than this are treated as equal
const DISTANCE_EPSILON: f32 = 1e-4;

/// A populated bucket selected for a query bearing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub bucket: usize,
    pub frame: FrameRef,
    /// Angular distance from the query to the bucket centre
    pub distance: f32,
}

/// Finds the nearest recorded frame for a bearing, tolerating sweep gaps
pub struct BearingMatcher {
    index: Arc<RingIndex>,
    tolerance: f32,
}

impl BearingMatcher {
    /// Matcher with the default tolerance of one bucket width
    pub fn new(index: Arc<RingIndex>) -> Self {
        let tolerance = index.bucket_width();
        Self { index, tolerance }
    }

    /// Matcher with an explicit angular tolerance in degrees
    pub fn with_tolerance(index: Arc<RingIndex>, tolerance: f32) -> Result<Self> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(AaremuError::InvalidConfig(format!(
                "tolerance must be a non-negative angle, got {}",
                tolerance
            )));
        }
        Ok(Self { index, tolerance })
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn index(&self) -> &Arc<RingIndex> {
        &self.index
    }

    /// Number of neighbour buckets searched on each side of the home bucket
    ///
    /// A neighbour `k` buckets away is in reach when `k * width < tolerance`.
    pub fn reach(&self) -> usize {
        let width = self.index.bucket_width();
        let half_ring = self.index.bucket_count() / 2;
        let mut k = 0;
        while k < half_ring && ((k + 1) as f32) * width < self.tolerance - DISTANCE_EPSILON {
            k += 1;
        }
        k
    }

    /// Find the populated bucket nearest to `query`
    ///
    /// Returns `NotFound` when nothing is recorded at all and `Gap` when
    /// nothing is recorded within tolerance. Equidistant candidates go to
    /// the more recently recorded frame.
    pub fn lookup(&self, query: f32) -> Result<Match> {
        let query = normalize_bearing(query);
        let count = self.index.bucket_count();
        let home = self.index.bucket_for(query);
        let reach = self.reach();

        let found = self.index.with_slots(|slots| {
            if slots.iter().all(|s| s.is_none()) {
                return Err(AaremuError::NotFound);
            }

            let mut best: Option<Match> = None;
            let mut consider = |bucket: usize| {
                let Some(frame) = slots[bucket] else {
                    return;
                };
                let distance = angular_distance(query, self.index.bucket_center(bucket));
                let better = match &best {
                    None => true,
                    Some(b) if (distance - b.distance).abs() <= DISTANCE_EPSILON => {
                        frame.timestamp > b.frame.timestamp
                    }
                    Some(b) => distance < b.distance,
                };
                if better {
                    best = Some(Match {
                        bucket,
                        frame,
                        distance,
                    });
                }
            };

            consider(home);
            for k in 1..=reach {
                let below = (home + count - k % count) % count;
                let above = (home + k) % count;
                consider(below);
                if above != below {
                    consider(above);
                }
            }

            best.ok_or(AaremuError::Gap { bearing: query })
        });

        if let Ok(m) = &found {
            trace!("Bearing {:.2} matched bucket {} ({:.2} off)", query, m.bucket, m.distance);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(timestamp: i64, bearing: f32) -> FrameRef {
        FrameRef {
            offset: timestamp as u64 * 10,
            length: 10,
            timestamp,
            bearing,
        }
    }

    fn full_sweep() -> Arc<RingIndex> {
        let index = Arc::new(RingIndex::new(1.0).unwrap());
        for b in 0..360 {
            index.put(b as f32, frame(b as i64, b as f32));
        }
        index
    }

    #[test]
    fn test_nearest_bucket() {
        let matcher = BearingMatcher::new(full_sweep());
        assert_eq!(matcher.lookup(0.4).unwrap().bucket, 0);
        assert_eq!(matcher.lookup(180.6).unwrap().bucket, 181);
        assert_eq!(matcher.lookup(359.7).unwrap().bucket, 0);
    }

    #[test]
    fn test_gap_depends_on_tolerance() {
        let index = full_sweep();
        index.remove(181.0);

        let tight = BearingMatcher::with_tolerance(index.clone(), 1.0).unwrap();
        assert!(matches!(tight.lookup(180.6), Err(AaremuError::Gap { .. })));

        let wide = BearingMatcher::with_tolerance(index, 2.0).unwrap();
        let m = wide.lookup(180.6).unwrap();
        assert_eq!(m.bucket, 180);
        assert!((m.distance - 0.6).abs() < 1e-3);
    }

    #[test]
    fn test_empty_store_is_not_found() {
        let matcher = BearingMatcher::new(Arc::new(RingIndex::new(1.0).unwrap()));
        for b in [0.0, 90.0, 359.9] {
            assert!(matches!(matcher.lookup(b), Err(AaremuError::NotFound)));
        }
    }

    #[test]
    fn test_far_bucket_is_gap() {
        let index = Arc::new(RingIndex::new(1.0).unwrap());
        index.put(90.0, frame(1, 90.0));
        let matcher = BearingMatcher::with_tolerance(index, 5.0).unwrap();

        assert!(matches!(matcher.lookup(270.0), Err(AaremuError::Gap { .. })));
        assert_eq!(matcher.lookup(93.0).unwrap().bucket, 90);
    }

    #[test]
    fn test_tie_prefers_recent_frame() {
        let index = Arc::new(RingIndex::new(1.0).unwrap());
        index.put(10.0, frame(500, 10.0));
        index.put(12.0, frame(900, 12.0));
        let matcher = BearingMatcher::with_tolerance(index.clone(), 3.0).unwrap();

        // 11.0 sits exactly between buckets 10 and 12
        assert_eq!(matcher.lookup(11.0).unwrap().bucket, 12);

        index.put(10.0, frame(1000, 10.0));
        assert_eq!(matcher.lookup(11.0).unwrap().bucket, 10);
    }

    #[test]
    fn test_search_wraps_north() {
        let index = Arc::new(RingIndex::new(1.0).unwrap());
        index.put(358.0, frame(1, 358.0));
        let matcher = BearingMatcher::with_tolerance(index, 4.0).unwrap();
        assert_eq!(matcher.lookup(0.5).unwrap().bucket, 358);
    }

    #[test]
    fn test_reach() {
        let index = full_sweep();
        assert_eq!(BearingMatcher::new(index.clone()).reach(), 0);
        assert_eq!(BearingMatcher::with_tolerance(index.clone(), 2.0).unwrap().reach(), 1);
        assert_eq!(BearingMatcher::with_tolerance(index.clone(), 2.5).unwrap().reach(), 2);
        assert_eq!(BearingMatcher::with_tolerance(index, 1000.0).unwrap().reach(), 180);
    }

    #[test]
    fn test_lookup_after_put_roundtrip() {
        let index = Arc::new(RingIndex::new(1.0).unwrap());
        let matcher = BearingMatcher::new(index.clone());
        for tenth in 0..3600 {
            let b = tenth as f32 / 10.0;
            let f = frame(tenth as i64, b);
            index.put(b, f);
            assert_eq!(matcher.lookup(b).unwrap().frame, f);
        }
    }
}
