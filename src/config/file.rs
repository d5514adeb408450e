//! Toolkit configuration file support

use crate::playback::{CadenceMode, GapPolicy, PlaybackConfig};
use crate::record::WriterConfig;
use crate::store::{PixelFormat, MAX_BUCKET_COUNT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the working directory
pub const LOCAL_CONFIG_NAME: &str = "aaremu.toml";

/// Toolkit configuration loaded from a TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Log level (trace, debug, info, warn, error); CLI flags override it
    pub log_level: String,

    /// Log file path (empty = stderr)
    pub log_file: String,

    pub recording: RecordingSection,
    pub playback: PlaybackSection,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: String::new(),
            recording: RecordingSection::default(),
            playback: PlaybackSection::default(),
        }
    }
}

/// `[recording]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSection {
    /// Directory new recordings are written to
    pub directory: PathBuf,
    /// Bucket width in degrees
    pub bucket_width: f32,
    pub queue_capacity: usize,
    pub min_frame_interval_ms: i64,
    pub drain_timeout_ms: u64,
    /// Frame geometry recorded in the header (0 = unknown)
    pub frame_width: u32,
    pub frame_height: u32,
    pub pixel_format: PixelFormat,
}

impl Default for RecordingSection {
    fn default() -> Self {
        let writer = WriterConfig::default();
        Self {
            directory: PathBuf::from("recordings"),
            bucket_width: 1.0,
            queue_capacity: writer.queue_capacity,
            min_frame_interval_ms: writer.min_frame_interval_ms,
            drain_timeout_ms: writer.drain_timeout.as_millis() as u64,
            frame_width: 0,
            frame_height: 0,
            pixel_format: PixelFormat::default(),
        }
    }
}

/// `[playback]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSection {
    pub mode: CadenceMode,
    pub fps: i32,
    /// Matching tolerance in degrees (unset = one bucket width)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f32>,
    pub gap_policy: GapPolicy,
    pub repeat: bool,
    pub shutdown_timeout_ms: u64,
    pub idle_interval_ms: u64,
    pub max_frame_delay_ms: u64,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        let playback = PlaybackConfig::default();
        Self {
            mode: playback.mode,
            fps: playback.fps,
            tolerance: playback.tolerance,
            gap_policy: playback.gap_policy,
            repeat: playback.repeat,
            shutdown_timeout_ms: playback.shutdown_timeout.as_millis() as u64,
            idle_interval_ms: playback.idle_interval.as_millis() as u64,
            max_frame_delay_ms: playback.max_frame_delay.as_millis() as u64,
        }
    }
}

impl ToolkitConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Working directory: aaremu.toml
    /// 2. User config directory: aaremu/config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        let local = Path::new(LOCAL_CONFIG_NAME);
        if local.exists() {
            return Self::load(local);
        }

        if let Some(path) = Self::user_config_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Self::default())
    }

    /// Per-user config file location, if the platform has one
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("aaremu").join("config.toml"))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                    path: parent.to_string_lossy().to_string(),
                    source: e,
                })?;
            }
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Reject values the recorder or player cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let width = self.recording.bucket_width;
        if !(width > 0.0 && width <= 360.0) {
            return Err(ConfigError::Invalid(format!(
                "recording.bucket_width must be in (0, 360], got {}",
                width
            )));
        }
        if (360.0 / width).round() > MAX_BUCKET_COUNT as f32 {
            return Err(ConfigError::Invalid(format!(
                "recording.bucket_width {} gives more than {} buckets",
                width, MAX_BUCKET_COUNT
            )));
        }
        if self.recording.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "recording.queue_capacity must be at least 1".into(),
            ));
        }
        if let Some(tolerance) = self.playback.tolerance {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "playback.tolerance must be a non-negative angle, got {}",
                    tolerance
                )));
            }
        }
        if self.playback.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "playback.shutdown_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Convert to WriterConfig
    pub fn to_writer_config(&self) -> WriterConfig {
        WriterConfig {
            queue_capacity: self.recording.queue_capacity,
            min_frame_interval_ms: self.recording.min_frame_interval_ms,
            drain_timeout: Duration::from_millis(self.recording.drain_timeout_ms),
        }
    }

    /// Convert to PlaybackConfig
    pub fn to_playback_config(&self) -> PlaybackConfig {
        let p = &self.playback;
        PlaybackConfig {
            mode: p.mode,
            fps: p.fps,
            tolerance: p.tolerance,
            gap_policy: p.gap_policy,
            repeat: p.repeat,
            shutdown_timeout: Duration::from_millis(p.shutdown_timeout_ms),
            idle_interval: Duration::from_millis(p.idle_interval_ms),
            max_frame_delay: Duration::from_millis(p.max_frame_delay_ms),
        }
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# aaremu configuration
# Looked up as ./aaremu.toml, then in the user config directory (aaremu/config.toml)

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = stderr)
log_file = ""

[recording]
# Directory new recordings are written to
directory = "recordings"

# Bucket width in degrees; 1.0 gives 360 buckets
bucket_width = 1.0

# Frames queued between camera and disk before new frames are dropped
queue_capacity = 6

# Frames closer than this to the previous one are skipped (0 = keep all)
min_frame_interval_ms = 5

# Time allowed to drain queued frames when recording stops
drain_timeout_ms = 2000

# Frame geometry stored in the recording header (0 = unknown)
frame_width = 0
frame_height = 0
pixel_format = "nv21"

[playback]
# continuous, dirty-only or free-run
mode = "continuous"

# Ticks per second; 0 follows the recorded frame spacing
fps = 30

# Matching tolerance in degrees (default: one bucket width)
# tolerance = 2.0

# What to show over unrecorded bearings: hold-last or placeholder
gap_policy = "hold-last"

# Loop free-run playback
repeat = false

shutdown_timeout_ms = 2000
idle_interval_ms = 20
max_frame_delay_ms = 1000
"#
        .to_string()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file
    Io {
        path: String,
        source: std::io::Error,
    },
    /// Error parsing TOML
    Parse {
        path: String,
        source: toml::de::Error,
    },
    /// Error serializing config
    Serialize(toml::ser::Error),
    /// Value out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to access config file '{}': {}", path, source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file '{}': {}", path, source)
            }
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Invalid(message) => write!(f, "Invalid configuration: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses_to_defaults() {
        let parsed: ToolkitConfig = toml::from_str(&ToolkitConfig::sample_config()).unwrap();
        assert_eq!(parsed, ToolkitConfig::default());
        parsed.validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ToolkitConfig = toml::from_str(
            r#"
            [playback]
            mode = "dirty-only"
            gap_policy = "placeholder"
            tolerance = 2.5
            "#,
        )
        .unwrap();

        assert_eq!(config.recording, RecordingSection::default());
        let playback = config.to_playback_config();
        assert_eq!(playback.mode, CadenceMode::DirtyOnly);
        assert_eq!(playback.gap_policy, GapPolicy::Placeholder);
        assert_eq!(playback.tolerance, Some(2.5));
        assert_eq!(playback.fps, 30);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ToolkitConfig::default();
        config.recording.bucket_width = 0.5;
        config.recording.pixel_format = PixelFormat::Rgba;
        config.playback.fps = 0;
        config.save(&path).unwrap();

        let loaded = ToolkitConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.to_writer_config().drain_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[recording]\nbucket_width = 0.0\n").unwrap();
        assert!(matches!(
            ToolkitConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "[recording]\nbucket_width = 1e-30\n").unwrap();
        assert!(matches!(
            ToolkitConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "[playback]\nmode = \"sideways\"\n").unwrap();
        assert!(matches!(
            ToolkitConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = ToolkitConfig::load("/nonexistent/aaremu.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/aaremu.toml"));
    }
}
