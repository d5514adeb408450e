//! aaremu - bearing-indexed camera recording and playback CLI

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use aaremu::config::{Args, Command, ToolkitConfig};
use aaremu::events::{EventSender, StatusEvent};
use aaremu::playback::{
    BearingMatcher, CadenceMode, FrameSink, GapPolicy, PlaybackDriver, PlaybackState,
    ReviewSweep, ServedFrame,
};
use aaremu::record::FrameWriter;
use aaremu::store::{
    FrameReader, FrameRecord, GeoFix, OrientationSample, PixelFormat, RecordingHeader,
    RecordingPaths,
};
use aaremu::AaremuError;

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ToolkitConfig::load(path)?,
        None => ToolkitConfig::load_default()?,
    };

    // Initialize logging
    init_logging(&args, &config)?;

    // Execute command
    match args.command {
        Command::Import {
            source,
            recording,
            bucket_width,
            geometry,
            format,
        } => cmd_import(&config, &source, &recording, bucket_width, geometry, format),
        Command::Info { recording } => cmd_info(&recording),
        Command::Lookup {
            recording,
            bearing,
            tolerance,
        } => cmd_lookup(&config, &recording, bearing, tolerance),
        Command::Play {
            recording,
            mode,
            fps,
            gap,
            from,
            to,
            step,
            dwell,
            repeat,
            duration,
            out,
        } => cmd_play(
            &config,
            &recording,
            PlayOptions {
                mode,
                fps,
                gap,
                from,
                to,
                step,
                dwell: Duration::from_millis(dwell),
                repeat,
                duration: duration.map(Duration::from_secs),
                out,
            },
        ),
        Command::Config { init } => cmd_config(&config, init.as_deref()),
    }
}

fn init_logging(args: &Args, config: &ToolkitConfig) -> Result<()> {
    let level = args
        .log_level()
        .map(|l| l.to_string())
        .unwrap_or_else(|| config.log_level.clone());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = args
        .log
        .clone()
        .or_else(|| (!config.log_file.is_empty()).then(|| config.log_file.clone()));

    if let Some(log_file) = log_file {
        let file = std::fs::File::create(&log_file)
            .with_context(|| format!("cannot create log file {}", log_file))?;
        subscriber.with_ansi(false).with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

/// Parse `<timestamp>_<bearing>` frame dump names
fn parse_frame_name(stem: &str) -> Option<(i64, f32)> {
    let (timestamp, bearing) = stem.split_once('_')?;
    let timestamp = timestamp.parse().ok()?;
    let bearing: f32 = bearing.parse().ok()?;
    bearing.is_finite().then_some((timestamp, bearing))
}

/// Build a recording from raw frame dumps
fn cmd_import(
    config: &ToolkitConfig,
    source: &Path,
    recording: &Path,
    bucket_width: Option<f32>,
    geometry: Option<(u32, u32)>,
    format: Option<PixelFormat>,
) -> Result<()> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(source)
        .with_context(|| format!("cannot read frame directory {}", source.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("raw") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        match parse_frame_name(stem) {
            Some((timestamp, bearing)) => frames.push((timestamp, bearing, path)),
            None => warn!("Skipping {}: name is not <timestamp>_<bearing>", path.display()),
        }
    }

    if frames.is_empty() {
        bail!("no frame files found in {}", source.display());
    }
    frames.sort_by_key(|(timestamp, _, _)| *timestamp);

    let paths = RecordingPaths::from_base(recording);
    std::fs::create_dir_all(paths.dir())?;

    let width = bucket_width.unwrap_or(config.recording.bucket_width);
    let mut header = RecordingHeader::new(paths.name(), width);
    let (frame_width, frame_height) =
        geometry.unwrap_or((config.recording.frame_width, config.recording.frame_height));
    header = header.with_frame(
        frame_width,
        frame_height,
        format.unwrap_or(config.recording.pixel_format),
    );

    println!("Importing {} frames into {}", frames.len(), paths);

    let mut writer = FrameWriter::start(
        paths.clone(),
        header,
        config.to_writer_config(),
        EventSender::none(),
    )?;
    let producer = writer.producer();

    for (timestamp, bearing, path) in &frames {
        let payload =
            std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        let record = FrameRecord::new(*bearing, *timestamp, payload);

        // The queue is sized for live capture; wait for the writer instead of dropping
        loop {
            match producer.offer(record.clone()) {
                Ok(()) => break,
                Err(AaremuError::Backpressure { .. }) => {
                    std::thread::sleep(Duration::from_millis(2))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let summary = writer.finish()?;
    let stats = summary.stats;
    println!(
        "Wrote {} frames ({} skipped, {} failed), {} of {} buckets populated",
        stats.written,
        stats.skipped,
        stats.failed,
        summary.header.indexed_count,
        summary.header.bucket_count
    );
    Ok(())
}

/// Show recording header, coverage and gaps
fn cmd_info(recording: &Path) -> Result<()> {
    let paths = RecordingPaths::from_base(recording);
    let reader = match FrameReader::open(&paths) {
        Ok(reader) => reader,
        Err(AaremuError::NotFound) => bail!("recording not found: {}", paths),
        Err(e) => return Err(e.into()),
    };

    let header = reader.header();
    let index = reader.index();

    println!("Recording: {}\n", paths);
    println!("  Format:     v{}", header.format_version);
    println!("  Sealed:     {}", if header.sealed { "Yes" } else { "No" });
    match header.frame_size() {
        Some(size) => println!(
            "  Frames:     {}x{} {} ({} bytes)",
            header.frame_width, header.frame_height, header.pixel_format, size
        ),
        None => println!("  Frames:     geometry unknown"),
    }
    println!("  Written:    {}", header.frame_count);
    println!(
        "  Time span:  {} .. {} ms",
        header.first_timestamp, header.last_timestamp
    );
    if let Some(interval) = reader.mean_frame_interval() {
        println!("  Interval:   {:?} mean", interval);
    }
    println!("  Locations:  {}", reader.locations().len());
    println!("  Heading:    {} orientation samples", reader.orientations().len());

    let populated = index.populated();
    let count = index.bucket_count();
    println!(
        "  Coverage:   {}/{} buckets of {}° ({:.1}%)",
        populated,
        count,
        index.bucket_width(),
        populated as f64 * 100.0 / count as f64
    );

    let gaps = index.gaps();
    if gaps.is_empty() {
        println!("  Gaps:       none");
    } else {
        println!("  Gaps:");
        for gap in gaps {
            let from = index.bucket_center(gap.start);
            let to = index.bucket_center((gap.start + gap.len - 1) % count);
            println!("    {:6.1}° .. {:6.1}°  ({} buckets)", from, to, gap.len);
        }
    }

    Ok(())
}

/// Find the frame served for a bearing
fn cmd_lookup(
    config: &ToolkitConfig,
    recording: &Path,
    bearing: f32,
    tolerance: Option<f32>,
) -> Result<()> {
    let paths = RecordingPaths::from_base(recording);
    let reader = FrameReader::open(&paths)?;

    let matcher = match tolerance.or(config.playback.tolerance) {
        Some(t) => BearingMatcher::with_tolerance(reader.index().clone(), t)?,
        None => BearingMatcher::new(reader.index().clone()),
    };

    match matcher.lookup(bearing) {
        Ok(found) => {
            println!("Bearing {:.2}° -> bucket {}\n", bearing, found.bucket);
            println!("  Centre:     {:.2}°", reader.index().bucket_center(found.bucket));
            println!("  Recorded:   {:.2}°", found.frame.bearing);
            println!("  Distance:   {:.2}°", found.distance);
            println!("  Timestamp:  {} ms", found.frame.timestamp);
            println!(
                "  Location:   offset {}, {} bytes",
                found.frame.offset, found.frame.length
            );
        }
        Err(AaremuError::Gap { .. }) => {
            println!(
                "Bearing {:.2}° is in a gap (tolerance {:.2}°)",
                bearing,
                matcher.tolerance()
            );
        }
        Err(AaremuError::NotFound) => println!("Recording {} holds no frames", paths),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

struct PlayOptions {
    mode: Option<CadenceMode>,
    fps: Option<i32>,
    gap: Option<GapPolicy>,
    from: f32,
    to: f32,
    step: f32,
    dwell: Duration,
    repeat: bool,
    duration: Option<Duration>,
    out: Option<PathBuf>,
}

/// Display sink for the CLI: optionally dumps served frames to files
struct FrameDump {
    out: Option<PathBuf>,
}

impl FrameSink for FrameDump {
    fn on_frame(&mut self, frame: &ServedFrame) -> anyhow::Result<()> {
        debug!(
            "Frame {} bearing {:.1} bucket {:?}{}",
            frame.sequence,
            frame.bearing,
            frame.bucket,
            if frame.placeholder { " (placeholder)" } else { "" }
        );

        if let Some(dir) = &self.out {
            let name = format!(
                "{:06}_{}_{:.1}.raw",
                frame.sequence, frame.timestamp, frame.bearing
            );
            std::fs::write(dir.join(name), &frame.payload[..])?;
        }
        Ok(())
    }

    fn on_location(&mut self, fix: &GeoFix) {
        info!(
            "Location at {} ms: {:.6}, {:.6} ({:.0} m, ±{:.0} m)",
            fix.timestamp, fix.latitude, fix.longitude, fix.altitude, fix.accuracy
        );
    }

    fn on_orientation(&mut self, sample: &OrientationSample) {
        debug!("Orientation at {} ms: {:.1}°", sample.timestamp, sample.bearing);
    }
}

/// Play a recording against a scripted bearing sweep
fn cmd_play(config: &ToolkitConfig, recording: &Path, options: PlayOptions) -> Result<()> {
    let paths = RecordingPaths::from_base(recording);

    let mut playback = config.to_playback_config();
    if let Some(mode) = options.mode {
        playback.mode = mode;
    }
    if let Some(fps) = options.fps {
        playback.fps = fps;
    }
    if let Some(gap) = options.gap {
        playback.gap_policy = gap;
    }
    playback.repeat = playback.repeat || options.repeat;
    let mode = playback.mode;

    if let Some(dir) = &options.out {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create output directory {}", dir.display()))?;
    }

    let sweep = Arc::new(ReviewSweep::new(
        options.from,
        options.to,
        options.step,
        options.dwell,
        options.repeat,
    )?);

    let (event_tx, event_rx) = bounded(64);
    let driver = PlaybackDriver::new(
        paths.clone(),
        playback,
        sweep.clone(),
        FrameDump { out: options.out },
    )
    .with_events(EventSender::new(event_tx));

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let _ = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        r.store(false, Ordering::SeqCst);
    });

    match driver.start() {
        Ok(()) => println!("Playing {} ({}). Press Ctrl+C to stop.\n", paths, mode),
        Err(AaremuError::NotFound) => bail!("recording {} is missing or empty", paths),
        Err(e) => {
            error!("Failed to start playback: {}", e);
            return Err(e.into());
        }
    }

    let started = Instant::now();
    loop {
        report_events(&event_rx);

        if !running.load(Ordering::SeqCst) {
            break;
        }
        if driver.state() == PlaybackState::Stopped {
            break;
        }
        if options.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if mode != CadenceMode::FreeRun && sweep.is_complete() {
            info!("Sweep complete");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    driver.stop()?;
    report_events(&event_rx);

    let stats = driver.stats();
    println!(
        "\nServed {} frames over {} ticks ({} unchanged, {} in gaps, {} display errors)",
        stats.served, stats.ticks, stats.suppressed, stats.gaps, stats.callback_errors
    );
    if let Some(e) = driver.last_error() {
        bail!("playback failed: {}", e);
    }
    Ok(())
}

fn report_events(events: &Receiver<StatusEvent>) {
    for event in events.try_iter() {
        match event {
            StatusEvent::Gap { bearing } => info!("No frame recorded near {:.1}°", bearing),
            StatusEvent::FreeRunComplete { iteration } => info!("Pass {} complete", iteration),
            StatusEvent::SessionStopped { reason } => debug!("Session stopped: {:?}", reason),
            other => debug!("{:?}", other),
        }
    }
}

/// Show the effective configuration or write a sample file
fn cmd_config(config: &ToolkitConfig, init: Option<&Path>) -> Result<()> {
    match init {
        Some(path) => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, ToolkitConfig::sample_config())?;
            println!("Wrote sample configuration to {}", path.display());
        }
        None => {
            let text = toml::to_string_pretty(config)?;
            println!("{}", text);
            if let Some(user) = ToolkitConfig::user_config_path() {
                println!("# User config file: {}", user.display());
            }
        }
    }
    Ok(())
}
