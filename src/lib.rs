//! aaremu - bearing-indexed camera recording and playback
//!
//! Frames captured while panning a camera are stored in a ring of compass
//! bearing buckets. Playback serves the recorded frame nearest to the
//! current bearing, so a recorded scene can be "looked around" later.

pub mod config;
pub mod error;
pub mod events;
pub mod playback;
pub mod record;
pub mod store;
pub mod sync;

pub use error::{AaremuError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
