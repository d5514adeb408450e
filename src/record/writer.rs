//! Frame writer - consumer thread draining captured frames to the backing store

use crate::error::{AaremuError, Result};
use crate::events::{EventSender, StatusEvent};
use crate::store::{
    FrameRecord, GeoFix, OrientationSample, RecordSink, RecordingHeader, RecordingPaths,
    RingIndex, StoreWriter,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the writer thread checks the stop flag while idle
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Extra time allowed for sealing after the drain deadline
const SEAL_GRACE: Duration = Duration::from_secs(2);

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Bounded queue capacity between producer and writer
    pub queue_capacity: usize,
    /// Frames closer than this to the last written frame are skipped (0 = keep all)
    pub min_frame_interval_ms: i64,
    /// Maximum time spent draining queued frames at session end
    pub drain_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 6,
            min_frame_interval_ms: 5,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Snapshot of writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Frames accepted into the queue
    pub accepted: u64,
    /// Frames dropped because the queue was full
    pub dropped: u64,
    /// Frames skipped as too close to the previous one
    pub skipped: u64,
    /// Frames appended to the store
    pub written: u64,
    /// Frames that failed to write
    pub failed: u64,
    /// Location fixes written
    pub locations: u64,
    /// Orientation samples written
    pub orientations: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    locations: AtomicU64,
    orientations: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            locations: self.locations.load(Ordering::Relaxed),
            orientations: self.orientations.load(Ordering::Relaxed),
        }
    }
}

/// Result of a finished recording session
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    /// Header as written when the store was sealed
    pub header: RecordingHeader,
    pub stats: WriterStats,
}

/// Message sent to the writer thread
enum WriterMessage {
    Frame(FrameRecord),
    Location(GeoFix),
    Orientation(OrientationSample),
    /// Drain what is queued, then seal
    Finish,
}

/// Cloneable, non-blocking handle for the capture side
///
/// Safe to move into camera or location callbacks: `offer` never blocks.
#[derive(Clone)]
pub struct FrameProducer {
    tx: Sender<WriterMessage>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    events: EventSender,
}

impl FrameProducer {
    /// Queue a captured frame for writing
    ///
    /// Returns `Backpressure` (and drops the frame) when the queue is full.
    pub fn offer(&self, record: FrameRecord) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AaremuError::ChannelError("recording already finished".into()));
        }

        let timestamp = record.timestamp;
        match self.tx.try_send(WriterMessage::Frame(record)) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let dropped_total = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Frame queue full, dropped frame at {}ms", timestamp);
                self.events.emit(StatusEvent::Backpressure {
                    timestamp,
                    dropped_total,
                });
                Err(AaremuError::Backpressure { timestamp })
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(AaremuError::ChannelError("writer thread has exited".into()))
            }
        }
    }

    /// Queue a location fix for pass-through storage
    pub fn offer_location(&self, fix: GeoFix) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AaremuError::ChannelError("recording already finished".into()));
        }

        match self.tx.try_send(WriterMessage::Location(fix)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Frame queue full, dropped location fix at {}ms", fix.timestamp);
                Err(AaremuError::Backpressure {
                    timestamp: fix.timestamp,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(AaremuError::ChannelError("writer thread has exited".into()))
            }
        }
    }

    /// Queue a raw orientation reading for pass-through storage
    pub fn offer_orientation(&self, sample: OrientationSample) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AaremuError::ChannelError("recording already finished".into()));
        }

        match self.tx.try_send(WriterMessage::Orientation(sample)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Frame queue full, dropped orientation at {}ms", sample.timestamp);
                Err(AaremuError::Backpressure {
                    timestamp: sample.timestamp,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(AaremuError::ChannelError("writer thread has exited".into()))
            }
        }
    }

    /// Get a snapshot of the writer counters
    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }
}

/// Signals a running writer to drain and stop; usable from any thread
#[derive(Clone)]
pub struct WriterStopHandle {
    stop_flag: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl WriterStopHandle {
    /// Stop accepting frames and ask the writer thread to drain and seal
    pub fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

/// Recording session owning the writer thread
pub struct FrameWriter {
    producer: FrameProducer,
    index: Arc<RingIndex>,
    config: WriterConfig,
    stop_flag: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<io::Result<RecordingHeader>>>,
}

impl FrameWriter {
    /// Create a recording on disk and start the writer thread
    pub fn start(
        paths: RecordingPaths,
        header: RecordingHeader,
        config: WriterConfig,
        events: EventSender,
    ) -> Result<Self> {
        let index = Arc::new(RingIndex::new(header.bucket_width)?);
        let store = StoreWriter::create(paths, header)?;
        Self::with_sink(store, index, config, events)
    }

    /// Start a writer thread over any record sink
    pub fn with_sink<S>(
        sink: S,
        index: Arc<RingIndex>,
        config: WriterConfig,
        events: EventSender,
    ) -> Result<Self>
    where
        S: RecordSink + 'static,
    {
        if config.queue_capacity == 0 {
            return Err(AaremuError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }

        let (tx, rx) = bounded::<WriterMessage>(config.queue_capacity);
        let (done_tx, done_rx) = bounded::<()>(1);
        let counters = Arc::new(Counters::default());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let producer = FrameProducer {
            tx,
            counters: counters.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            events: events.clone(),
        };

        let ctx = WriterContext {
            rx,
            index: index.clone(),
            counters,
            events,
            stop_flag: stop_flag.clone(),
            min_frame_interval_ms: config.min_frame_interval_ms,
            drain_timeout: config.drain_timeout,
        };

        let handle = thread::Builder::new()
            .name("aaremu-writer".into())
            .spawn(move || {
                let result = writer_thread(sink, ctx);
                let _ = done_tx.send(());
                result
            })?;

        info!(
            "Frame writer started (queue capacity {})",
            config.queue_capacity
        );

        Ok(Self {
            producer,
            index,
            config,
            stop_flag,
            done_rx,
            handle: Some(handle),
        })
    }

    /// Get a producer handle for the capture thread
    pub fn producer(&self) -> FrameProducer {
        self.producer.clone()
    }

    /// Get a handle that can stop the writer from another thread
    pub fn stop_handle(&self) -> WriterStopHandle {
        WriterStopHandle {
            stop_flag: self.stop_flag.clone(),
            closed: self.producer.closed.clone(),
        }
    }

    /// Live bucket index, shared with a preview reader
    pub fn index(&self) -> Arc<RingIndex> {
        self.index.clone()
    }

    /// Queue a captured frame; see [`FrameProducer::offer`]
    pub fn offer(&self, record: FrameRecord) -> Result<()> {
        self.producer.offer(record)
    }

    /// Get a snapshot of the writer counters
    pub fn stats(&self) -> WriterStats {
        self.producer.stats()
    }

    /// Check if the writer thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// End the session: drain queued frames (bounded), then seal the store
    pub fn finish(&mut self) -> Result<RecordingSummary> {
        let Some(handle) = self.handle.take() else {
            return Err(AaremuError::ChannelError("recording already finished".into()));
        };

        info!("Finishing recording...");
        self.producer.closed.store(true, Ordering::Release);

        // The stop flag covers the case where Finish cannot be queued in time
        if self
            .producer
            .tx
            .send_timeout(WriterMessage::Finish, self.config.drain_timeout)
            .is_err()
        {
            self.stop_flag.store(true, Ordering::SeqCst);
        }

        let wait = self.config.drain_timeout + SEAL_GRACE;
        match self.done_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                self.stop_flag.store(true, Ordering::SeqCst);
                warn!("Writer thread did not finish within {:?}, detaching", wait);
                return Err(AaremuError::ChannelError(
                    "writer thread did not finish in time".into(),
                ));
            }
        }

        let stats = self.producer.stats();
        match handle.join() {
            Ok(Ok(header)) => {
                info!(
                    "Recording finished: {} written, {} dropped, {} skipped, {} failed",
                    stats.written, stats.dropped, stats.skipped, stats.failed
                );
                Ok(RecordingSummary { header, stats })
            }
            Ok(Err(e)) => {
                error!("Failed to seal recording: {}", e);
                Err(AaremuError::Io(e))
            }
            Err(_) => Err(AaremuError::ChannelError("writer thread panicked".into())),
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.finish();
        }
    }
}

/// State moved into the writer thread
struct WriterContext {
    rx: Receiver<WriterMessage>,
    index: Arc<RingIndex>,
    counters: Arc<Counters>,
    events: EventSender,
    stop_flag: Arc<AtomicBool>,
    min_frame_interval_ms: i64,
    drain_timeout: Duration,
}

/// Writer thread function
fn writer_thread<S: RecordSink>(mut sink: S, ctx: WriterContext) -> io::Result<RecordingHeader> {
    info!("Writer thread started");

    let mut last_written: Option<i64> = None;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if drain_deadline.is_none() && ctx.stop_flag.load(Ordering::Relaxed) {
            drain_deadline = Some(Instant::now() + ctx.drain_timeout);
        }

        let message = match drain_deadline {
            None => match ctx.rx.recv_timeout(POLL_INTERVAL) {
                Ok(m) => m,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            Some(deadline) => {
                if Instant::now() >= deadline {
                    let abandoned = ctx.rx.len();
                    if abandoned > 0 {
                        warn!("Drain timeout reached, abandoning {} queued items", abandoned);
                    }
                    break;
                }
                match ctx.rx.try_recv() {
                    Ok(m) => m,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        };

        match message {
            WriterMessage::Frame(record) => {
                write_frame(&mut sink, &ctx, &record, &mut last_written);
            }
            WriterMessage::Location(fix) => match sink.append_location(&fix) {
                Ok(()) => {
                    ctx.counters.locations.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Failed to write location fix at {}ms: {}", fix.timestamp, e),
            },
            WriterMessage::Orientation(sample) => match sink.append_orientation(&sample) {
                Ok(()) => {
                    ctx.counters.orientations.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(
                    "Failed to write orientation at {}ms: {}",
                    sample.timestamp, e
                ),
            },
            WriterMessage::Finish => {
                debug!("Finish requested, draining {} queued items", ctx.rx.len());
                drain_deadline.get_or_insert(Instant::now() + ctx.drain_timeout);
            }
        }
    }

    let result = sink.seal(&ctx.index);
    if let Ok(header) = &result {
        ctx.events.emit(StatusEvent::RecordingSealed {
            frames: header.frame_count,
            indexed: header.indexed_count,
        });
    }

    info!("Writer thread stopped");
    result
}

/// Append one frame and index it; failures are counted and skipped
fn write_frame<S: RecordSink>(
    sink: &mut S,
    ctx: &WriterContext,
    record: &FrameRecord,
    last_written: &mut Option<i64>,
) {
    // Only frames shortly after the last one are duplicates; a clock that
    // steps backwards starts a new run
    if let Some(delta) = last_written.and_then(|last| record.timestamp.checked_sub(last)) {
        if (0..ctx.min_frame_interval_ms).contains(&delta) {
            ctx.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    match sink.append(record) {
        Ok(frame) => {
            ctx.index.put(record.bearing, frame);
            ctx.counters.written.fetch_add(1, Ordering::Relaxed);
            *last_written = Some(record.timestamp);
        }
        Err(e) => {
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Error writing frame at {}ms: {}", record.timestamp, e);
            ctx.events.emit(StatusEvent::WriteFailure {
                timestamp: record.timestamp,
                message: e.to_string(),
            });
        }
    }
}
