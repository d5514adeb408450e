//! Frame storage: bearing-bucket index, backing files and recording header

mod backing;
mod header;
mod ring;

pub use backing::{FrameReader, RecordSink, RecordingPaths, ScannedFrame, StoreWriter};
pub use header::{PixelFormat, RecordingHeader, HEADER_FORMAT_VERSION};
pub use ring::{BucketRange, RingIndex, MAX_BUCKET_COUNT};

/// Normalize a bearing into [0, 360)
pub fn normalize_bearing(bearing: f32) -> f32 {
    let b = bearing.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if b >= 360.0 {
        0.0
    } else {
        b
    }
}

/// Smallest angle between two bearings, in degrees (0..=180)
pub fn angular_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// A captured camera frame tagged with compass bearing
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Compass bearing in degrees [0, 360)
    pub bearing: f32,
    /// Capture time in milliseconds
    pub timestamp: i64,
    /// Raw frame bytes (NV21, RGBA or RGB)
    pub payload: Vec<u8>,
}

impl FrameRecord {
    /// Create a record, normalizing the bearing
    pub fn new(bearing: f32, timestamp: i64, payload: Vec<u8>) -> Self {
        Self {
            bearing: normalize_bearing(bearing),
            timestamp,
            payload,
        }
    }
}

/// Location of one frame payload inside the backing file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRef {
    /// Byte offset of the payload in the frames file
    pub offset: u64,
    /// Payload length in bytes
    pub length: u32,
    /// Original capture timestamp (ms)
    pub timestamp: i64,
    /// Bearing the frame was recorded at
    pub bearing: f32,
}

/// Location fix passed through from the platform location provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFix {
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f32,
}

/// Raw orientation reading stored alongside the frames for free-run replay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationSample {
    pub timestamp: i64,
    /// Device bearing in degrees, as reported by the orientation provider
    pub bearing: f32,
}
