use aaremu::events::{EventSender, StatusEvent};
use aaremu::playback::{
    BearingMatcher, CadenceMode, PlaybackConfig, PlaybackDriver, ServedFrame, SharedBearing,
};
use aaremu::record::{FrameProducer, FrameWriter, WriterConfig};
use aaremu::store::{
    FrameReader, FrameRecord, OrientationSample, RecordingHeader, RecordingPaths,
};
use aaremu::AaremuError;
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn offer_blocking(producer: &FrameProducer, record: FrameRecord) {
    loop {
        match producer.offer(record.clone()) {
            Ok(()) => return,
            Err(AaremuError::Backpressure { .. }) => thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("offer failed: {}", e),
        }
    }
}

fn payload_for(bearing: f32) -> Vec<u8> {
    vec![(bearing as u32 % 251) as u8; 16]
}

/// Record one frame per listed bearing, 40 ms apart
fn record(dir: &Path, name: &str, bearings: impl IntoIterator<Item = f32>) -> RecordingPaths {
    let paths = RecordingPaths::new(dir, name);
    let mut writer = FrameWriter::start(
        paths.clone(),
        RecordingHeader::new(name, 1.0),
        WriterConfig::default(),
        EventSender::none(),
    )
    .unwrap();
    let producer = writer.producer();

    for (i, bearing) in bearings.into_iter().enumerate() {
        offer_blocking(
            &producer,
            FrameRecord::new(bearing, i as i64 * 40, payload_for(bearing)),
        );
    }
    writer.finish().unwrap();
    paths
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !done() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn record_count_never_exceeds_bucket_count() {
    let dir = tempdir().unwrap();
    // Two passes at half-degree steps: 1440 frames over 360 buckets
    let bearings = (0..1440).map(|i| (i % 720) as f32 * 0.5);
    let paths = record(dir.path(), "double", bearings);

    let reader = FrameReader::open(&paths).unwrap();
    let header = reader.header();
    assert!(header.sealed);
    assert_eq!(header.frame_count, 1440);
    assert_eq!(header.indexed_count, 360);
    assert!(reader.index().populated() <= reader.index().bucket_count());
    assert!(reader.index().gaps().is_empty());

    // Second pass overwrote the first
    let frame = reader.index().get(90.0).unwrap();
    assert!(frame.timestamp >= 720 * 40);
}

#[test]
fn worked_example_from_disk() {
    let dir = tempdir().unwrap();
    let full = record(dir.path(), "full", (0..360).map(|b| b as f32));

    let reader = FrameReader::open(&full).unwrap();
    let matcher = BearingMatcher::new(reader.index().clone());
    assert_eq!(matcher.lookup(0.4).unwrap().bucket, 0);
    assert_eq!(matcher.lookup(180.6).unwrap().bucket, 181);

    let holed = record(
        dir.path(),
        "holed",
        (0..360).filter(|b| *b != 181).map(|b| b as f32),
    );
    let reader = FrameReader::open(&holed).unwrap();
    let index = reader.index().clone();

    let tight = BearingMatcher::with_tolerance(index.clone(), 1.0).unwrap();
    assert!(matches!(tight.lookup(180.6), Err(AaremuError::Gap { .. })));

    let wide = BearingMatcher::with_tolerance(index, 2.0).unwrap();
    assert_eq!(wide.lookup(180.6).unwrap().bucket, 180);
}

#[test]
fn recorded_sweep_plays_back_by_bearing() {
    let dir = tempdir().unwrap();
    let paths = record(dir.path(), "sweep", (0..360).map(|b| b as f32));

    let bearing = Arc::new(SharedBearing::new());
    bearing.set(45.0, 0);

    let served = Arc::new(Mutex::new(Vec::<ServedFrame>::new()));
    let out = served.clone();
    let sink = move |frame: &ServedFrame| -> anyhow::Result<()> {
        out.lock().push(frame.clone());
        Ok(())
    };

    let config = PlaybackConfig {
        mode: CadenceMode::DirtyOnly,
        fps: 100,
        ..PlaybackConfig::default()
    };
    let (tx, rx) = unbounded();
    let driver = PlaybackDriver::new(paths, config, bearing.clone(), sink)
        .with_events(EventSender::new(tx));
    driver.start().unwrap();

    for target in [45.0, 46.2, 300.0] {
        bearing.set(target, 0);
        wait_for(|| driver.cursor().last_bucket == Some(target.round() as usize));
    }
    driver.stop().unwrap();

    let served = served.lock();
    let buckets: Vec<usize> = served.iter().filter_map(|f| f.bucket).collect();
    assert_eq!(buckets, vec![45, 46, 300]);
    assert_eq!(&served[2].payload[..], &payload_for(300.0)[..]);

    let stopped = rx
        .try_iter()
        .any(|e| matches!(e, StatusEvent::SessionStopped { .. }));
    assert!(stopped);
}

#[test]
fn live_playback_while_recording() {
    let dir = tempdir().unwrap();
    let paths = RecordingPaths::new(dir.path(), "live");
    let mut writer = FrameWriter::start(
        paths.clone(),
        RecordingHeader::new("live", 1.0),
        WriterConfig::default(),
        EventSender::none(),
    )
    .unwrap();

    let producer = writer.producer();
    for b in 0..10 {
        offer_blocking(
            &producer,
            FrameRecord::new(b as f32, b * 40, payload_for(b as f32)),
        );
    }
    wait_for(|| writer.stats().written == 10);

    let bearing = Arc::new(SharedBearing::new());
    bearing.set(5.0, 0);
    let served = Arc::new(Mutex::new(Vec::<ServedFrame>::new()));
    let out = served.clone();
    let sink = move |frame: &ServedFrame| -> anyhow::Result<()> {
        out.lock().push(frame.clone());
        Ok(())
    };

    let driver = PlaybackDriver::new(paths, PlaybackConfig::default(), bearing, sink)
        .with_live_index(writer.index());
    driver.start().unwrap();
    wait_for(|| !served.lock().is_empty());
    driver.stop().unwrap();

    let summary = writer.finish().unwrap();
    assert_eq!(summary.stats.written, 10);

    let served = served.lock();
    assert!(!served.is_empty());
    assert_eq!(served[0].bucket, Some(5));
    assert_eq!(&served[0].payload[..], &payload_for(5.0)[..]);
}

#[test]
fn orientation_stream_survives_reopen() {
    let dir = tempdir().unwrap();
    let paths = RecordingPaths::new(dir.path(), "heading");
    let mut writer = FrameWriter::start(
        paths.clone(),
        RecordingHeader::new("heading", 1.0),
        WriterConfig::default(),
        EventSender::none(),
    )
    .unwrap();
    let producer = writer.producer();

    for i in 0..30i64 {
        let bearing = i as f32 * 3.0;
        if i % 3 == 0 {
            offer_blocking(&producer, FrameRecord::new(bearing, i * 10, payload_for(bearing)));
        }
        let sample = OrientationSample {
            timestamp: i * 10 + 1,
            bearing,
        };
        while let Err(AaremuError::Backpressure { .. }) = producer.offer_orientation(sample) {
            thread::sleep(Duration::from_millis(1));
        }
    }
    let summary = writer.finish().unwrap();
    assert_eq!(summary.stats.orientations, 30);
    assert_eq!(summary.header.orientation_count, 30);

    let reader = FrameReader::open(&paths).unwrap();
    let samples = reader.orientations();
    assert_eq!(samples.len(), 30);
    assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(samples[29].bearing, 87.0);
    assert_eq!(reader.index().populated(), 10);
}
