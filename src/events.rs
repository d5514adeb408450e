//! Status events reported to the hosting application

use crossbeam_channel::{Sender, TrySendError};
use tracing::trace;

/// Why a playback session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// Free-run reached the end of the recording without repeat
    Completed,
    /// Reading the recording failed
    Error(String),
}

/// Events from the recorder and player that external controllers might care about
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Frame queue full, frame dropped
    Backpressure { timestamp: i64, dropped_total: u64 },
    /// One record could not be written and was skipped
    WriteFailure { timestamp: i64, message: String },
    /// Recording closed and index flushed
    RecordingSealed { frames: u64, indexed: u64 },
    /// Bearing moved into an area with no recorded frame
    Gap { bearing: f32 },
    /// Free-run pass finished; `iteration` counts completed passes
    FreeRunComplete { iteration: u32 },
    /// Playback session ended
    SessionStopped { reason: StopReason },
}

/// Optional, non-blocking event channel
///
/// Events are dropped rather than blocking a worker thread when the
/// listener falls behind.
#[derive(Clone, Default)]
pub struct EventSender(Option<Sender<StatusEvent>>);

impl EventSender {
    /// Send events to the given channel
    pub fn new(tx: Sender<StatusEvent>) -> Self {
        Self(Some(tx))
    }

    /// Discard all events
    pub fn none() -> Self {
        Self(None)
    }

    /// Deliver an event if a listener is attached
    pub fn emit(&self, event: StatusEvent) {
        let Some(tx) = &self.0 else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => trace!("Event listener lagging, dropped {:?}", event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
