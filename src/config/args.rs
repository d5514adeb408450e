//! CLI argument parsing using clap

use crate::playback::{CadenceMode, GapPolicy};
use crate::store::PixelFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aaremu - bearing-indexed camera recording and playback
///
/// Record frames keyed by compass bearing and play them back by pointing
#[derive(Parser, Debug)]
#[command(name = "aaremu")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Configuration file (default: ./aaremu.toml, then the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a recording from a directory of `<timestamp>_<bearing>.raw` frame dumps
    Import {
        /// Directory holding the frame files
        source: PathBuf,

        /// Recording to create (path without extension)
        recording: PathBuf,

        /// Bucket width in degrees (default: from config)
        #[arg(long)]
        bucket_width: Option<f32>,

        /// Frame geometry as WIDTHxHEIGHT, stored in the header
        #[arg(long, value_parser = parse_geometry)]
        geometry: Option<(u32, u32)>,

        /// Pixel format of the frames
        #[arg(long)]
        format: Option<PixelFormat>,
    },

    /// Show recording header, coverage and gaps
    Info {
        /// Recording path (with or without extension)
        recording: PathBuf,
    },

    /// Find the frame served for a bearing
    Lookup {
        recording: PathBuf,

        /// Bearing in degrees
        #[arg(allow_hyphen_values = true)]
        bearing: f32,

        /// Matching tolerance in degrees (default: from config)
        #[arg(short, long)]
        tolerance: Option<f32>,
    },

    /// Play a recording against a scripted bearing sweep
    Play {
        recording: PathBuf,

        /// Cadence: continuous, dirty-only, free-run
        #[arg(short, long)]
        mode: Option<CadenceMode>,

        /// Ticks per second (0 = recorded spacing)
        #[arg(long)]
        fps: Option<i32>,

        /// Gap handling: hold-last, placeholder
        #[arg(long)]
        gap: Option<GapPolicy>,

        /// Sweep start bearing
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        from: f32,

        /// Sweep end bearing (equal to start = full circle)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        to: f32,

        /// Sweep step in degrees
        #[arg(long, default_value = "1")]
        step: f32,

        /// Time spent on each sweep position in milliseconds
        #[arg(long, default_value = "50")]
        dwell: u64,

        /// Keep sweeping back and forth (or loop free-run)
        #[arg(long)]
        repeat: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Write served frames to this directory
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show the effective configuration or write a sample file
    Config {
        /// Write a commented sample configuration to this path
        #[arg(long)]
        init: Option<PathBuf>,
    },
}

fn parse_geometry(value: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let width = w.trim().parse().map_err(|_| format!("bad width '{}'", w))?;
    let height = h.trim().parse().map_err(|_| format!("bad height '{}'", h))?;
    Ok((width, height))
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> Option<tracing::Level> {
        if self.quiet {
            Some(tracing::Level::ERROR)
        } else {
            match self.verbose {
                0 => None,
                1 => Some(tracing::Level::DEBUG),
                _ => Some(tracing::Level::TRACE),
            }
        }
    }
}
