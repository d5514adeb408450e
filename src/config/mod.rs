//! Configuration: command line arguments and the toolkit config file

mod args;
mod file;

pub use args::{Args, Command};
pub use file::{ConfigError, PlaybackSection, RecordingSection, ToolkitConfig, LOCAL_CONFIG_NAME};
