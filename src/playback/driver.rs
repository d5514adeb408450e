//! Playback driver - serves recorded frames to a display sink on a tick loop

use crate::error::{AaremuError, Result};
use crate::events::{EventSender, StatusEvent, StopReason};
use crate::playback::bearing::BearingSource;
use crate::playback::matcher::BearingMatcher;
use crate::store::{
    FrameReader, GeoFix, OrientationSample, RecordingPaths, RingIndex, ScannedFrame,
};
use crate::sync::{Cadence, Pacer};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// When frames are served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CadenceMode {
    /// Serve the matched frame on every tick
    #[default]
    Continuous,
    /// Serve only when the matched bucket changes
    DirtyOnly,
    /// Ignore the bearing and replay frames in recorded order
    FreeRun,
}

impl FromStr for CadenceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" => Ok(CadenceMode::Continuous),
            "dirty-only" | "dirty_only" | "dirty" => Ok(CadenceMode::DirtyOnly),
            "free-run" | "free_run" | "freerun" => Ok(CadenceMode::FreeRun),
            other => Err(format!("unknown cadence mode: {}", other)),
        }
    }
}

impl fmt::Display for CadenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CadenceMode::Continuous => "continuous",
            CadenceMode::DirtyOnly => "dirty-only",
            CadenceMode::FreeRun => "free-run",
        };
        f.write_str(name)
    }
}

/// What to show while the bearing points at an unrecorded area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    /// Keep showing the last served frame
    #[default]
    HoldLast,
    /// Serve a zeroed frame of the recorded frame size
    Placeholder,
}

impl FromStr for GapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hold-last" | "hold_last" | "hold" => Ok(GapPolicy::HoldLast),
            "placeholder" | "blank" => Ok(GapPolicy::Placeholder),
            other => Err(format!("unknown gap policy: {}", other)),
        }
    }
}

impl fmt::Display for GapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GapPolicy::HoldLast => "hold-last",
            GapPolicy::Placeholder => "placeholder",
        })
    }
}

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub mode: CadenceMode,
    /// Ticks per second; zero or negative follows the recorded frame spacing
    pub fps: i32,
    /// Matching tolerance in degrees (default: one bucket width)
    pub tolerance: Option<f32>,
    pub gap_policy: GapPolicy,
    /// Restart free-run playback at the end of the recording
    pub repeat: bool,
    /// How long `stop()` waits for the playback thread
    pub shutdown_timeout: Duration,
    /// Bearing poll interval for dirty-only playback without a fixed fps
    pub idle_interval: Duration,
    /// Longest pause honoured between two recorded frames in free-run
    pub max_frame_delay: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mode: CadenceMode::Continuous,
            fps: 30,
            tolerance: None,
            gap_policy: GapPolicy::HoldLast,
            repeat: false,
            shutdown_timeout: Duration::from_secs(2),
            idle_interval: Duration::from_millis(20),
            max_frame_delay: Duration::from_secs(1),
        }
    }
}

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// A frame handed to the display sink
#[derive(Debug, Clone)]
pub struct ServedFrame {
    pub payload: Arc<[u8]>,
    /// Original capture timestamp in ms (bearing reading time for placeholders)
    pub timestamp: i64,
    /// Matched bucket; `None` for placeholders
    pub bucket: Option<usize>,
    /// Query bearing, or the recorded bearing in free-run
    pub bearing: f32,
    pub placeholder: bool,
    /// Position in the session's serve order, starting at 1
    pub sequence: u64,
}

/// Display side of playback
pub trait FrameSink: Send + 'static {
    /// Show a frame. Errors are logged and counted; playback continues.
    fn on_frame(&mut self, frame: &ServedFrame) -> anyhow::Result<()>;

    /// Recorded location fix reached during free-run playback
    fn on_location(&mut self, _fix: &GeoFix) {}

    /// Recorded orientation reading reached during free-run playback
    fn on_orientation(&mut self, _sample: &OrientationSample) {}
}

impl<F> FrameSink for F
where
    F: FnMut(&ServedFrame) -> anyhow::Result<()> + Send + 'static,
{
    fn on_frame(&mut self, frame: &ServedFrame) -> anyhow::Result<()> {
        self(frame)
    }
}

/// Where playback currently is
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    /// Last bearing read from the source
    pub current_bearing: Option<f32>,
    /// Bucket of the last served frame
    pub last_bucket: Option<usize>,
    /// Timestamp of the last served frame
    pub last_timestamp: Option<i64>,
}

/// Snapshot of playback counters for the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub ticks: u64,
    /// Frames handed to the sink, placeholders included
    pub served: u64,
    /// Ticks that served nothing because the match did not change
    pub suppressed: u64,
    /// Ticks spent in a gap
    pub gaps: u64,
    pub callback_errors: u64,
    /// Completed free-run passes
    pub iterations: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    served: AtomicU64,
    suppressed: AtomicU64,
    gaps: AtomicU64,
    callback_errors: AtomicU64,
    iterations: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PlaybackStats {
        PlaybackStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.ticks,
            &self.served,
            &self.suppressed,
            &self.gaps,
            &self.callback_errors,
            &self.iterations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// State shared between the driver handle and the playback thread
struct Shared {
    state: Mutex<PlaybackState>,
    cursor: Mutex<PlaybackCursor>,
    last_error: Mutex<Option<String>>,
    counters: Counters,
}

/// Command sent to the playback thread
enum Control {
    Pause,
    Resume,
    Stop,
}

/// A running playback thread
struct Session {
    control_tx: Sender<Control>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

/// Drives playback of one recording
///
/// All control methods take `&self` and may be called from any thread.
/// Each `start()` opens the recording read-only; the file handle is closed
/// before the playback thread reports completion.
pub struct PlaybackDriver {
    paths: RecordingPaths,
    config: PlaybackConfig,
    bearing: Arc<dyn BearingSource>,
    sink: SharedSink,
    events: EventSender,
    live_index: Option<Arc<RingIndex>>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl PlaybackDriver {
    pub fn new<B, S>(paths: RecordingPaths, config: PlaybackConfig, bearing: B, sink: S) -> Self
    where
        B: BearingSource + 'static,
        S: FrameSink,
    {
        let sink: Box<dyn FrameSink> = Box::new(sink);
        Self {
            paths,
            config,
            bearing: Arc::new(bearing),
            sink: Arc::new(Mutex::new(sink)),
            events: EventSender::none(),
            live_index: None,
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState::Idle),
                cursor: Mutex::new(PlaybackCursor::default()),
                last_error: Mutex::new(None),
                counters: Counters::default(),
            }),
            session: Mutex::new(None),
        }
    }

    /// Report status events on the given sender
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Play a recording that is still being written, using the writer's index
    pub fn with_live_index(mut self, index: Arc<RingIndex>) -> Self {
        self.live_index = Some(index);
        self
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.counters.snapshot()
    }

    pub fn cursor(&self) -> PlaybackCursor {
        *self.shared.cursor.lock()
    }

    /// Error that ended the last session, if any
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Open the recording and start the playback thread
    pub fn start(&self) -> Result<()> {
        let mut session = self.session.lock();

        match self.state() {
            PlaybackState::Idle | PlaybackState::Stopped => {}
            PlaybackState::Running | PlaybackState::Paused => return Err(AaremuError::AlreadyRunning),
        }

        // A previous session that ended on its own still needs joining
        if let Some(old) = session.take() {
            if old.handle.is_finished() {
                let _ = old.handle.join();
            }
        }

        info!("Starting {} playback of {}", self.config.mode, self.paths);

        let reader = match &self.live_index {
            Some(index) => FrameReader::open_shared(&self.paths, index.clone())?,
            None => FrameReader::open(&self.paths)?,
        };
        if reader.is_empty() {
            return Err(AaremuError::NotFound);
        }

        let matcher = match self.config.tolerance {
            Some(tolerance) => BearingMatcher::with_tolerance(reader.index().clone(), tolerance)?,
            None => BearingMatcher::new(reader.index().clone()),
        };

        let cadence = Cadence::from_fps(
            self.config.fps,
            reader.mean_frame_interval(),
            self.config.max_frame_delay,
        );
        let bearing_interval = match (self.config.mode, cadence) {
            (CadenceMode::DirtyOnly, Cadence::Recorded { .. }) => self.config.idle_interval,
            _ => cadence.tick_interval(),
        };
        debug!(
            "Playback cadence {:?}, tolerance {:.2}, reach {} buckets",
            cadence,
            matcher.tolerance(),
            matcher.reach()
        );

        let placeholder: Arc<[u8]> = vec![0u8; reader.placeholder_size()].into();
        let first_offset = reader.first_offset();

        let (control_tx, control_rx) = bounded(8);
        let (done_tx, done_rx) = bounded(1);

        self.shared.counters.reset();
        *self.shared.cursor.lock() = PlaybackCursor::default();
        *self.shared.last_error.lock() = None;
        *self.shared.state.lock() = PlaybackState::Running;

        let worker = PlaybackLoop {
            reader,
            matcher,
            pacer: Pacer::new(cadence),
            mode: self.config.mode,
            gap_policy: self.config.gap_policy,
            repeat: self.config.repeat,
            bearing_interval,
            bearing: self.bearing.clone(),
            sink: self.sink.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            control_rx,
            placeholder,
            last_frame: None,
            last_key: None,
            in_gap: false,
            sequence: 0,
            next_offset: first_offset,
            pending: None,
            location_cursor: 0,
            orientation_cursor: 0,
            iteration: 0,
        };

        let handle = thread::Builder::new()
            .name("aaremu-playback".into())
            .spawn(move || playback_thread(worker, done_tx))
            .map_err(|e| {
                *self.shared.state.lock() = PlaybackState::Stopped;
                AaremuError::Io(e)
            })?;

        *session = Some(Session {
            control_tx,
            done_rx,
            handle,
        });
        Ok(())
    }

    /// Pause a running session
    pub fn pause(&self) -> Result<()> {
        let session = self.session.lock();
        {
            let mut state = self.shared.state.lock();
            if *state != PlaybackState::Running {
                return Err(AaremuError::invalid_state("pause", *state));
            }
            *state = PlaybackState::Paused;
        }
        if let Some(s) = session.as_ref() {
            let _ = s.control_tx.try_send(Control::Pause);
        }
        info!("Playback paused");
        Ok(())
    }

    /// Resume a paused session
    pub fn resume(&self) -> Result<()> {
        let session = self.session.lock();
        {
            let mut state = self.shared.state.lock();
            if *state != PlaybackState::Paused {
                return Err(AaremuError::invalid_state("resume", *state));
            }
            *state = PlaybackState::Running;
        }
        if let Some(s) = session.as_ref() {
            let _ = s.control_tx.try_send(Control::Resume);
        }
        info!("Playback resumed");
        Ok(())
    }

    /// Stop the session and release the recording
    ///
    /// Waits up to the configured shutdown timeout; a playback thread that
    /// overruns it is detached. Any state ends in `Stopped`.
    pub fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            *self.shared.state.lock() = PlaybackState::Stopped;
            return Ok(());
        };

        info!("Stopping playback...");
        // A full control queue means the thread is already behind on
        // commands; dropping the sender below disconnects it either way
        let _ = session.control_tx.try_send(Control::Stop);
        drop(session.control_tx);

        let timeout = self.config.shutdown_timeout;
        match session.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if session.handle.join().is_err() {
                    error!("Playback thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Playback thread did not stop within {:?}, detaching", timeout);
            }
        }

        *self.shared.state.lock() = PlaybackState::Stopped;
        info!("Playback stopped");
        Ok(())
    }
}

impl Drop for PlaybackDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn playback_thread(worker: PlaybackLoop, done_tx: Sender<()>) {
    info!("Playback thread started");

    let shared = worker.shared.clone();
    let events = worker.events.clone();

    // Consumes the loop, closing the recording before completion is signalled
    let reason = worker.run();

    match &reason {
        StopReason::Error(message) => {
            error!("Playback stopped on error: {}", message);
            *shared.last_error.lock() = Some(message.clone());
        }
        StopReason::Completed => info!("Free-run playback completed"),
        StopReason::Requested => {}
    }

    *shared.state.lock() = PlaybackState::Stopped;
    events.emit(StatusEvent::SessionStopped { reason });
    let _ = done_tx.send(());
    info!("Playback thread stopped");
}

/// Outcome of one tick
enum Tick {
    /// Schedule the next tick after this interval
    Next(Duration),
    /// Free-run reached the end of the recording
    Finished,
}

/// State owned by the playback thread
struct PlaybackLoop {
    reader: FrameReader,
    matcher: BearingMatcher,
    pacer: Pacer,
    mode: CadenceMode,
    gap_policy: GapPolicy,
    repeat: bool,
    bearing_interval: Duration,
    bearing: Arc<dyn BearingSource>,
    sink: SharedSink,
    shared: Arc<Shared>,
    events: EventSender,
    control_rx: Receiver<Control>,
    placeholder: Arc<[u8]>,
    last_frame: Option<ServedFrame>,
    /// Bucket of the last served frame (`Some(None)` for a placeholder)
    last_key: Option<Option<usize>>,
    in_gap: bool,
    sequence: u64,
    // Free-run position
    next_offset: u64,
    pending: Option<ScannedFrame>,
    location_cursor: usize,
    orientation_cursor: usize,
    iteration: u32,
}

impl PlaybackLoop {
    fn run(mut self) -> StopReason {
        loop {
            match self.control_rx.recv_timeout(self.pacer.time_until_tick()) {
                Ok(Control::Pause) => {
                    if !self.wait_paused() {
                        return StopReason::Requested;
                    }
                    self.pacer.reset();
                    continue;
                }
                Ok(Control::Resume) => continue,
                Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    return StopReason::Requested
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.shared.counters.ticks.fetch_add(1, Ordering::Relaxed);
            let tick = match self.mode {
                CadenceMode::FreeRun => self.free_run_tick(),
                CadenceMode::Continuous | CadenceMode::DirtyOnly => self.bearing_tick(),
            };

            match tick {
                Ok(Tick::Next(interval)) => self.pacer.schedule(interval),
                Ok(Tick::Finished) => return StopReason::Completed,
                Err(e) => return StopReason::Error(e.to_string()),
            }
        }
    }

    /// Block until resumed; returns false if stopped while paused
    fn wait_paused(&self) -> bool {
        loop {
            match self.control_rx.recv() {
                Ok(Control::Resume) => return true,
                Ok(Control::Pause) => {}
                Ok(Control::Stop) | Err(_) => return false,
            }
        }
    }

    fn bearing_tick(&mut self) -> Result<Tick> {
        let interval = self.bearing_interval;
        let Some(reading) = self.bearing.reading() else {
            trace!("No bearing available");
            return Ok(Tick::Next(interval));
        };
        self.shared.cursor.lock().current_bearing = Some(reading.bearing);
        let dirty_only = self.mode == CadenceMode::DirtyOnly;

        let frame = match self.matcher.lookup(reading.bearing) {
            Ok(found) => {
                self.in_gap = false;
                if dirty_only && self.last_key == Some(Some(found.bucket)) {
                    self.shared.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    return Ok(Tick::Next(interval));
                }
                let payload = self
                    .reader
                    .read_payload(&found.frame)
                    .map_err(AaremuError::StoreIo)?;
                ServedFrame {
                    payload: payload.into(),
                    timestamp: found.frame.timestamp,
                    bucket: Some(found.bucket),
                    bearing: reading.bearing,
                    placeholder: false,
                    sequence: 0,
                }
            }
            // A live index can still be empty; treat it as a gap
            Err(AaremuError::Gap { .. }) | Err(AaremuError::NotFound) => {
                self.shared.counters.gaps.fetch_add(1, Ordering::Relaxed);
                if !self.in_gap {
                    self.in_gap = true;
                    debug!("Bearing {:.1} is in a gap", reading.bearing);
                    self.events.emit(StatusEvent::Gap {
                        bearing: reading.bearing,
                    });
                }

                match self.gap_policy {
                    GapPolicy::HoldLast => match &self.last_frame {
                        Some(last) if !dirty_only => last.clone(),
                        _ => {
                            self.shared.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                            return Ok(Tick::Next(interval));
                        }
                    },
                    GapPolicy::Placeholder => {
                        if dirty_only && self.last_key == Some(None) {
                            self.shared.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                            return Ok(Tick::Next(interval));
                        }
                        ServedFrame {
                            payload: self.placeholder.clone(),
                            timestamp: reading.timestamp,
                            bucket: None,
                            bearing: reading.bearing,
                            placeholder: true,
                            sequence: 0,
                        }
                    }
                }
            }
            Err(e) => return Err(e),
        };

        self.serve(frame);
        Ok(Tick::Next(interval))
    }

    fn free_run_tick(&mut self) -> Result<Tick> {
        let current = match self.pending.take() {
            Some(frame) => frame,
            None => match self.read_next()? {
                Some(frame) => frame,
                None => {
                    self.iteration += 1;
                    self.shared.counters.iterations.fetch_add(1, Ordering::Relaxed);
                    info!("Free-run pass {} complete", self.iteration);
                    self.events.emit(StatusEvent::FreeRunComplete {
                        iteration: self.iteration,
                    });
                    if !self.repeat {
                        return Ok(Tick::Finished);
                    }

                    self.next_offset = self.reader.first_offset();
                    self.location_cursor = 0;
                    self.orientation_cursor = 0;
                    match self.read_next()? {
                        Some(frame) => frame,
                        None => return Ok(Tick::Finished),
                    }
                }
            },
        };

        self.deliver_sidecars(current.frame.timestamp);

        let bucket = self.reader.index().bucket_for(current.frame.bearing);
        let timestamp = current.frame.timestamp;
        self.serve(ServedFrame {
            payload: current.payload.into(),
            timestamp,
            bucket: Some(bucket),
            bearing: current.frame.bearing,
            placeholder: false,
            sequence: 0,
        });

        self.pending = self.read_next()?;
        let cadence = self.pacer.cadence();
        let interval = match &self.pending {
            Some(next) => cadence.frame_interval(Some(timestamp), next.frame.timestamp),
            None => cadence.tick_interval(),
        };
        Ok(Tick::Next(interval))
    }

    fn read_next(&mut self) -> Result<Option<ScannedFrame>> {
        let scanned = self
            .reader
            .read_at(self.next_offset)
            .map_err(AaremuError::StoreIo)?;
        if let Some(frame) = &scanned {
            self.next_offset = frame.next_offset;
        }
        Ok(scanned)
    }

    /// Hand over location fixes and orientation readings recorded up to `timestamp`, oldest first
    fn deliver_sidecars(&mut self, timestamp: i64) {
        let locations = self.reader.locations();
        let orientations = self.reader.orientations();
        let mut sink = None;

        loop {
            let fix = locations
                .get(self.location_cursor)
                .filter(|fix| fix.timestamp <= timestamp);
            let sample = orientations
                .get(self.orientation_cursor)
                .filter(|sample| sample.timestamp <= timestamp);

            match (fix, sample) {
                (Some(fix), Some(sample)) if fix.timestamp <= sample.timestamp => {
                    sink.get_or_insert_with(|| self.sink.lock()).on_location(fix);
                    self.location_cursor += 1;
                }
                (_, Some(sample)) => {
                    sink.get_or_insert_with(|| self.sink.lock())
                        .on_orientation(sample);
                    self.orientation_cursor += 1;
                }
                (Some(fix), None) => {
                    sink.get_or_insert_with(|| self.sink.lock()).on_location(fix);
                    self.location_cursor += 1;
                }
                (None, None) => break,
            }
        }
    }

    fn serve(&mut self, mut frame: ServedFrame) {
        self.sequence += 1;
        frame.sequence = self.sequence;

        if let Err(e) = self.sink.lock().on_frame(&frame) {
            self.shared
                .counters
                .callback_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!("Display callback failed for frame {}: {:#}", frame.sequence, e);
        }
        self.shared.counters.served.fetch_add(1, Ordering::Relaxed);

        {
            let mut cursor = self.shared.cursor.lock();
            cursor.last_bucket = frame.bucket;
            cursor.last_timestamp = Some(frame.timestamp);
        }
        self.last_key = Some(frame.bucket);
        self.last_frame = Some(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::bearing::SharedBearing;
    use crate::store::{FrameRecord, FrameRef, RecordSink, RecordingHeader, StoreWriter};
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    fn record(dir: &std::path::Path, frames: &[(f32, i64)], fixes: &[i64]) -> RecordingPaths {
        record_with_orientation(dir, frames, fixes, &[])
    }

    fn record_with_orientation(
        dir: &std::path::Path,
        frames: &[(f32, i64)],
        fixes: &[i64],
        orientations: &[i64],
    ) -> RecordingPaths {
        let paths = RecordingPaths::new(dir, "clip");
        let index = RingIndex::new(1.0).unwrap();
        let mut writer =
            StoreWriter::create(paths.clone(), RecordingHeader::new("clip", 1.0)).unwrap();
        for (bearing, ts) in frames {
            let record = FrameRecord::new(*bearing, *ts, vec![(*ts % 251) as u8 + 1; 8]);
            let frame = writer.append(&record).unwrap();
            index.put(record.bearing, frame);
        }
        for ts in fixes {
            writer
                .append_location(&GeoFix {
                    timestamp: *ts,
                    latitude: 48.1,
                    longitude: 11.5,
                    altitude: 520.0,
                    accuracy: 4.0,
                })
                .unwrap();
        }
        for ts in orientations {
            writer
                .append_orientation(&OrientationSample {
                    timestamp: *ts,
                    bearing: (*ts % 360) as f32,
                })
                .unwrap();
        }
        writer.seal(&index).unwrap();
        paths
    }

    fn sweep(dir: &std::path::Path, bearings: std::ops::Range<i64>) -> RecordingPaths {
        let frames: Vec<(f32, i64)> = bearings.map(|b| (b as f32, b * 40)).collect();
        record(dir, &frames, &[])
    }

    fn collector() -> (Arc<Mutex<Vec<ServedFrame>>>, impl FrameSink) {
        let served = Arc::new(Mutex::new(Vec::new()));
        let out = served.clone();
        let sink = move |frame: &ServedFrame| -> anyhow::Result<()> {
            out.lock().push(frame.clone());
            Ok(())
        };
        (served, sink)
    }

    fn config(mode: CadenceMode, fps: i32) -> PlaybackConfig {
        PlaybackConfig {
            mode,
            fps,
            ..PlaybackConfig::default()
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_event(
        rx: &Receiver<StatusEvent>,
        matches: impl Fn(&StatusEvent) -> bool,
    ) -> Option<StatusEvent> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while let Ok(event) = rx.recv_deadline(deadline) {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    }

    #[test]
    fn test_continuous_serves_every_tick() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..360);
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(10.2, 0);

        let (served, sink) = collector();
        let driver = PlaybackDriver::new(paths, config(CadenceMode::Continuous, 100), bearing, sink);
        driver.start().unwrap();
        wait_for(|| served.lock().len() >= 5);
        driver.stop().unwrap();

        let stats = driver.stats();
        assert_eq!(stats.served, stats.ticks);
        assert_eq!(stats.suppressed, 0);

        let served = served.lock();
        assert!(served.len() >= 5);
        assert!(served.iter().all(|f| f.bucket == Some(10) && f.timestamp == 400));
        let sequences: Vec<u64> = served.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, (1..=served.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_dirty_only_serves_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..360);
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(10.0, 0);

        let (served, sink) = collector();
        let driver =
            PlaybackDriver::new(paths, config(CadenceMode::DirtyOnly, 100), bearing.clone(), sink);
        driver.start().unwrap();
        wait_for(|| driver.stats().suppressed >= 3);
        assert_eq!(served.lock().len(), 1);

        bearing.set(20.0, 1);
        wait_for(|| served.lock().len() >= 2);
        thread::sleep(Duration::from_millis(50));
        driver.stop().unwrap();

        let buckets: Vec<Option<usize>> = served.lock().iter().map(|f| f.bucket).collect();
        assert_eq!(buckets, vec![Some(10), Some(20)]);
    }

    #[test]
    fn test_gap_holds_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..10);
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(5.0, 0);

        let (tx, rx) = unbounded();
        let (served, sink) = collector();
        let driver =
            PlaybackDriver::new(paths, config(CadenceMode::Continuous, 100), bearing.clone(), sink)
                .with_events(EventSender::new(tx));
        driver.start().unwrap();
        wait_for(|| served.lock().len() >= 2);

        bearing.set(180.0, 1);
        wait_for(|| driver.stats().gaps >= 3);
        driver.stop().unwrap();

        let served = served.lock();
        assert!(served.iter().all(|f| f.bucket == Some(5) && !f.placeholder));

        let gaps = rx
            .try_iter()
            .filter(|e| matches!(e, StatusEvent::Gap { .. }))
            .count();
        assert_eq!(gaps, 1);
    }

    #[test]
    fn test_gap_serves_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..10);
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(5.0, 0);

        let mut cfg = config(CadenceMode::DirtyOnly, 100);
        cfg.gap_policy = GapPolicy::Placeholder;
        let (served, sink) = collector();
        let driver = PlaybackDriver::new(paths, cfg, bearing.clone(), sink);
        driver.start().unwrap();
        wait_for(|| served.lock().len() >= 1);

        bearing.set(180.0, 77);
        wait_for(|| driver.stats().gaps >= 3);
        driver.stop().unwrap();

        let served = served.lock();
        assert_eq!(served.len(), 2);
        let blank = &served[1];
        assert!(blank.placeholder);
        assert_eq!(blank.bucket, None);
        assert_eq!(blank.timestamp, 77);
        assert_eq!(blank.payload.len(), 8);
        assert!(blank.payload.iter().all(|b| *b == 0));
    }

    struct Journal(Arc<Mutex<Vec<String>>>);

    impl FrameSink for Journal {
        fn on_frame(&mut self, frame: &ServedFrame) -> anyhow::Result<()> {
            self.0.lock().push(format!("frame {}", frame.timestamp));
            Ok(())
        }

        fn on_location(&mut self, fix: &GeoFix) {
            self.0.lock().push(format!("fix {}", fix.timestamp));
        }

        fn on_orientation(&mut self, sample: &OrientationSample) {
            self.0.lock().push(format!("orientation {}", sample.timestamp));
        }
    }

    #[test]
    fn test_free_run_in_recorded_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(dir.path(), &[(90.0, 0), (10.0, 10), (200.0, 20)], &[5]);

        let (tx, rx) = unbounded();
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = PlaybackDriver::new(
            paths,
            config(CadenceMode::FreeRun, 200),
            SharedBearing::new(),
            Journal(log.clone()),
        )
        .with_events(EventSender::new(tx));
        driver.start().unwrap();

        let stopped = wait_event(&rx, |e| matches!(e, StatusEvent::SessionStopped { .. }));
        assert_eq!(
            stopped,
            Some(StatusEvent::SessionStopped {
                reason: StopReason::Completed
            })
        );
        wait_for(|| driver.state() == PlaybackState::Stopped);
        assert_eq!(driver.state(), PlaybackState::Stopped);
        assert_eq!(driver.stats().iterations, 1);
        assert_eq!(
            *log.lock(),
            vec!["frame 0", "fix 5", "frame 10", "frame 20"]
        );
    }

    #[test]
    fn test_free_run_replays_orientation() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record_with_orientation(
            dir.path(),
            &[(90.0, 0), (10.0, 10), (200.0, 20)],
            &[5],
            &[3, 5, 15, 25],
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = PlaybackDriver::new(
            paths,
            config(CadenceMode::FreeRun, 200),
            SharedBearing::new(),
            Journal(log.clone()),
        );
        driver.start().unwrap();
        wait_for(|| driver.state() == PlaybackState::Stopped);
        assert_eq!(driver.stats().iterations, 1);

        assert_eq!(
            *log.lock(),
            vec![
                "frame 0",
                "orientation 3",
                "fix 5",
                "orientation 5",
                "frame 10",
                "orientation 15",
                "frame 20",
            ]
        );
    }

    #[test]
    fn test_free_run_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(dir.path(), &[(1.0, 0), (2.0, 10)], &[]);

        let mut cfg = config(CadenceMode::FreeRun, 200);
        cfg.repeat = true;
        let (tx, rx) = unbounded();
        let (served, sink) = collector();
        let driver = PlaybackDriver::new(paths, cfg, SharedBearing::new(), sink)
            .with_events(EventSender::new(tx));
        driver.start().unwrap();

        let second = wait_event(&rx, |e| {
            matches!(e, StatusEvent::FreeRunComplete { iteration: 2 })
        });
        assert!(second.is_some());
        driver.stop().unwrap();

        let served = served.lock();
        let timestamps: Vec<i64> = served.iter().take(4).map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![0, 10, 0, 10]);
    }

    #[test]
    fn test_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..360);
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(42.0, 0);

        let (served, sink) = collector();
        let driver = PlaybackDriver::new(paths, config(CadenceMode::Continuous, 100), bearing, sink);
        driver.start().unwrap();
        wait_for(|| served.lock().len() >= 2);

        driver.pause().unwrap();
        assert_eq!(driver.state(), PlaybackState::Paused);
        thread::sleep(Duration::from_millis(30));
        let paused_at = served.lock().len();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(served.lock().len(), paused_at);

        driver.resume().unwrap();
        assert_eq!(driver.state(), PlaybackState::Running);
        wait_for(|| served.lock().len() > paused_at);
        assert!(served.lock().len() > paused_at);
        driver.stop().unwrap();
        assert_eq!(driver.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_invalid_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..360);
        let (_, sink) = collector();
        let driver =
            PlaybackDriver::new(paths, config(CadenceMode::Continuous, 50), SharedBearing::new(), sink);

        assert!(matches!(driver.pause(), Err(AaremuError::InvalidState { .. })));
        assert!(matches!(driver.resume(), Err(AaremuError::InvalidState { .. })));
        assert!(driver.stop().is_ok());
        assert_eq!(driver.state(), PlaybackState::Stopped);
        assert!(matches!(driver.pause(), Err(AaremuError::InvalidState { .. })));

        driver.start().unwrap();
        assert!(matches!(driver.start(), Err(AaremuError::AlreadyRunning)));
        assert!(matches!(driver.resume(), Err(AaremuError::InvalidState { .. })));
        driver.stop().unwrap();

        // A stopped driver can start a new session
        driver.start().unwrap();
        assert_eq!(driver.state(), PlaybackState::Running);
        driver.stop().unwrap();
    }

    #[test]
    fn test_empty_recording_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(dir.path(), &[], &[]);
        let (_, sink) = collector();
        let driver = PlaybackDriver::new(paths, PlaybackConfig::default(), SharedBearing::new(), sink);
        assert!(matches!(driver.start(), Err(AaremuError::NotFound)));
        assert_eq!(driver.state(), PlaybackState::Idle);

        let missing = RecordingPaths::new(dir.path(), "nothing-here");
        let (_, sink) = collector();
        let driver = PlaybackDriver::new(missing, PlaybackConfig::default(), SharedBearing::new(), sink);
        assert!(matches!(driver.start(), Err(AaremuError::NotFound)));
    }

    #[test]
    fn test_callback_errors_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..360);
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(1.0, 0);

        let sink = |_: &ServedFrame| -> anyhow::Result<()> { anyhow::bail!("display gone") };
        let driver = PlaybackDriver::new(paths, config(CadenceMode::Continuous, 100), bearing, sink);
        driver.start().unwrap();
        wait_for(|| driver.stats().callback_errors >= 3);

        assert_eq!(driver.state(), PlaybackState::Running);
        driver.stop().unwrap();
        assert!(driver.stats().callback_errors >= 3);
        assert!(driver.last_error().is_none());
    }

    #[test]
    fn test_stop_during_slow_tick() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..360);
        let frames_path = paths.frames();
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(100.0, 0);

        let in_callback = Arc::new(Mutex::new(false));
        let flag = in_callback.clone();
        let sink = move |_: &ServedFrame| -> anyhow::Result<()> {
            *flag.lock() = true;
            thread::sleep(Duration::from_millis(150));
            Ok(())
        };

        let mut cfg = config(CadenceMode::Continuous, 100);
        cfg.shutdown_timeout = Duration::from_secs(1);
        let driver = PlaybackDriver::new(paths, cfg, bearing, sink);
        driver.start().unwrap();
        wait_for(|| *in_callback.lock());

        let started = Instant::now();
        driver.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(driver.state(), PlaybackState::Stopped);

        #[cfg(target_os = "linux")]
        {
            let open = std::fs::read_dir("/proc/self/fd")
                .unwrap()
                .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
                .any(|target| target == frames_path);
            assert!(!open, "frames file still open after stop");
        }
        #[cfg(not(target_os = "linux"))]
        let _ = frames_path;
    }

    #[test]
    fn test_unreadable_frame_stops_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sweep(dir.path(), 0..10);

        // Live entry pointing past the end of the frames file
        let index = Arc::new(RingIndex::new(1.0).unwrap());
        index.put(
            30.0,
            FrameRef {
                offset: 1 << 20,
                length: 8,
                timestamp: 0,
                bearing: 30.0,
            },
        );
        let bearing = Arc::new(SharedBearing::new());
        bearing.set(30.0, 0);

        let (tx, rx) = unbounded();
        let (served, sink) = collector();
        let driver = PlaybackDriver::new(paths, config(CadenceMode::Continuous, 100), bearing, sink)
            .with_live_index(index)
            .with_events(EventSender::new(tx));
        driver.start().unwrap();

        let stopped = wait_event(&rx, |e| matches!(e, StatusEvent::SessionStopped { .. }));
        assert!(matches!(
            stopped,
            Some(StatusEvent::SessionStopped {
                reason: StopReason::Error(_)
            })
        ));
        wait_for(|| driver.state() == PlaybackState::Stopped);
        assert_eq!(driver.state(), PlaybackState::Stopped);
        assert!(driver.last_error().is_some());
        assert!(served.lock().is_empty());

        assert!(driver.stop().is_ok());
        assert_eq!(driver.state(), PlaybackState::Stopped);
    }

    fn arrival_gaps(paths: RecordingPaths, frames: usize, max_frame_delay: Duration) -> Vec<Duration> {
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let out = arrivals.clone();
        let sink = move |_: &ServedFrame| -> anyhow::Result<()> {
            out.lock().push(Instant::now());
            Ok(())
        };

        let mut cfg = config(CadenceMode::FreeRun, 0);
        cfg.max_frame_delay = max_frame_delay;
        let driver = PlaybackDriver::new(paths, cfg, SharedBearing::new(), sink);
        driver.start().unwrap();
        wait_for(|| arrivals.lock().len() >= frames);
        driver.stop().unwrap();

        let arrivals = arrivals.lock();
        arrivals.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[test]
    fn test_free_run_follows_recorded_spacing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(dir.path(), &[(1.0, 0), (2.0, 60), (3.0, 120)], &[]);

        let gaps = arrival_gaps(paths, 3, Duration::from_secs(1));
        assert_eq!(gaps.len(), 2);
        for gap in gaps {
            assert!(gap >= Duration::from_millis(45), "served after {:?}", gap);
            assert!(gap < Duration::from_millis(250), "served after {:?}", gap);
        }
    }

    #[test]
    fn test_free_run_delay_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(dir.path(), &[(1.0, 0), (2.0, 5_000)], &[]);

        let gaps = arrival_gaps(paths, 2, Duration::from_millis(50));
        assert_eq!(gaps.len(), 1);
        assert!(gaps[0] >= Duration::from_millis(35), "served after {:?}", gaps[0]);
        assert!(gaps[0] < Duration::from_millis(1_000), "served after {:?}", gaps[0]);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("dirty-only".parse::<CadenceMode>().unwrap(), CadenceMode::DirtyOnly);
        assert_eq!("FreeRun".parse::<CadenceMode>().unwrap(), CadenceMode::FreeRun);
        assert!("sideways".parse::<CadenceMode>().is_err());
        assert_eq!("placeholder".parse::<GapPolicy>().unwrap(), GapPolicy::Placeholder);
        assert_eq!(GapPolicy::HoldLast.to_string(), "hold-last");
    }
}
