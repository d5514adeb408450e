//! Tick scheduling for playback cadence

mod pacer;

pub use pacer::{Cadence, Pacer};
