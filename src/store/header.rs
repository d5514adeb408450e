//! Recording header sidecar (`<name>.head`)

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current on-disk format version
pub const HEADER_FORMAT_VERSION: u32 = 1;

/// Pixel layout of recorded frame payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// YUV 4:2:0 semi-planar, as delivered by camera preview callbacks
    #[default]
    Nv21,
    Rgba,
    Rgb,
}

impl PixelFormat {
    /// Bytes needed for one frame of the given dimensions
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv21 => pixels * 3 / 2,
            PixelFormat::Rgba => pixels * 4,
            PixelFormat::Rgb => pixels * 3,
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nv21" => Ok(PixelFormat::Nv21),
            "rgba" => Ok(PixelFormat::Rgba),
            "rgb" => Ok(PixelFormat::Rgb),
            other => Err(format!("unknown pixel format '{}'", other)),
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Nv21 => "nv21",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Rgb => "rgb",
        };
        f.write_str(name)
    }
}

/// Description of a recording, written at start and rewritten when sealed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingHeader {
    pub format_version: u32,
    /// Recording base name
    pub name: String,
    /// Degrees covered by one bucket
    pub bucket_width: f32,
    pub bucket_count: u32,
    /// Frame dimensions (0 when unknown)
    pub frame_width: u32,
    pub frame_height: u32,
    pub pixel_format: PixelFormat,
    /// Records appended to the frames file, including overwritten ones
    pub frame_count: u64,
    /// Buckets holding a frame after sealing
    pub indexed_count: u64,
    /// Timestamp of the first written frame (ms)
    pub first_timestamp: i64,
    /// Timestamp of the last written frame (ms)
    pub last_timestamp: i64,
    pub location_count: u64,
    pub orientation_count: u64,
    /// Set once the index has been flushed at recording stop
    pub sealed: bool,
}

impl Default for RecordingHeader {
    fn default() -> Self {
        Self {
            format_version: HEADER_FORMAT_VERSION,
            name: String::new(),
            bucket_width: 1.0,
            bucket_count: 360,
            frame_width: 0,
            frame_height: 0,
            pixel_format: PixelFormat::Nv21,
            frame_count: 0,
            indexed_count: 0,
            first_timestamp: 0,
            last_timestamp: 0,
            location_count: 0,
            orientation_count: 0,
            sealed: false,
        }
    }
}

impl RecordingHeader {
    /// Create a header for a new recording
    pub fn new(name: impl Into<String>, bucket_width: f32) -> Self {
        Self {
            name: name.into(),
            bucket_width,
            bucket_count: ((360.0 / bucket_width).round() as u32).max(1),
            ..Self::default()
        }
    }

    /// Set frame dimensions and pixel format
    pub fn with_frame(mut self, width: u32, height: u32, format: PixelFormat) -> Self {
        self.frame_width = width;
        self.frame_height = height;
        self.pixel_format = format;
        self
    }

    /// Expected payload size, if dimensions are known
    pub fn frame_size(&self) -> Option<usize> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return None;
        }
        Some(self.pixel_format.frame_size(self.frame_width, self.frame_height))
    }

    /// Read a header from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Write the header as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path.as_ref(), content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Nv21.frame_size(640, 480), 460_800);
        assert_eq!(PixelFormat::Rgba.frame_size(2, 2), 16);

        let header = RecordingHeader::new("sweep", 1.0);
        assert_eq!(header.frame_size(), None);
        let header = header.with_frame(4, 2, PixelFormat::Rgb);
        assert_eq!(header.frame_size(), Some(24));
    }

    #[test]
    fn test_header_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.head");

        let mut header = RecordingHeader::new("sweep", 0.5).with_frame(320, 240, PixelFormat::Rgba);
        header.frame_count = 12;
        header.sealed = true;
        header.save(&path).unwrap();

        let loaded = RecordingHeader::load(&path).unwrap();
        assert_eq!(loaded, header);
        assert_eq!(loaded.bucket_count, 720);
    }

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!("NV21".parse::<PixelFormat>().unwrap(), PixelFormat::Nv21);
        assert!("yuyv".parse::<PixelFormat>().is_err());
    }
}
