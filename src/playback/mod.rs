//! Bearing-keyed playback of a recording

mod bearing;
mod driver;
mod matcher;

pub use bearing::{BearingReading, BearingSource, ReviewSweep, SharedBearing};
pub use driver::{
    CadenceMode, FrameSink, GapPolicy, PlaybackConfig, PlaybackCursor, PlaybackDriver,
    PlaybackState, PlaybackStats, ServedFrame,
};
pub use matcher::{BearingMatcher, Match};
