pub mod bus;
pub mod capture;
pub mod control;
pub mod coord;
pub mod device;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod sensor;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::capture::BufferGeometry;
use crate::error::InitError;
use crate::host::UsbSpeed;
use crate::pipeline::{FOOTER_LEN, HEADER_LEN};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Device configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Bytes per capture buffer, header and footer room included
    pub buffer_size: usize,
    pub buffers_per_channel: usize,
    /// Capacity of the capture event queue
    pub event_queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Consecutive commit failures before streaming halts
    pub max_commit_failures: u32,
    /// Speed assumed until the first request of a connection
    pub default_speed: UsbSpeed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Camera terminal pan/tilt/zoom
    pub ptz_support: bool,
    /// Also accept vendor commands on the processing unit saturation control
    pub legacy_vendor_alias: bool,
    pub request_queue_depth: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16384,
            buffers_per_channel: 4,
            event_queue_depth: 16,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_commit_failures: 64,
            default_speed: UsbSpeed::Super,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            ptz_support: false,
            legacy_vendor_alias: true,
            request_queue_depth: 8,
        }
    }
}

impl CaptureConfig {
    pub fn geometry(&self) -> BufferGeometry {
        BufferGeometry {
            buffer_size: self.buffer_size,
            header_len: HEADER_LEN,
            footer_len: FOOTER_LEN,
            buffers_per_channel: self.buffers_per_channel,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `UVC__SECTION__KEY` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, InitError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Toml));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("UVC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InitError> {
        let capture = &self.capture;
        if capture.buffer_size <= HEADER_LEN + FOOTER_LEN {
            return Err(InitError::Invalid(format!(
                "buffer_size {} leaves no room for payload",
                capture.buffer_size
            )));
        }
        if capture.buffers_per_channel == 0 {
            return Err(InitError::Invalid("buffers_per_channel must be non-zero".into()));
        }
        let buffers = capture.geometry().buffer_count();
        if capture.event_queue_depth <= buffers {
            return Err(InitError::Invalid(format!(
                "event_queue_depth {} must exceed the {buffers} capture buffers",
                capture.event_queue_depth
            )));
        }
        if self.stream.max_commit_failures == 0 {
            return Err(InitError::Invalid("max_commit_failures must be non-zero".into()));
        }
        if self.control.request_queue_depth == 0 {
            return Err(InitError::Invalid("request_queue_depth must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.geometry().payload_capacity(), 16368);
        assert_eq!(config.capture.geometry().buffer_count(), 8);
    }

    #[test]
    fn loads_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[capture]
buffer_size = 4096

[stream]
default_speed = "high"

[control]
ptz_support = true
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.buffer_size, 4096);
        assert_eq!(config.capture.buffers_per_channel, 4);
        assert_eq!(config.stream.default_speed, UsbSpeed::High);
        assert!(config.control.ptz_support);
        assert!(config.control.legacy_vendor_alias);
    }

    #[test]
    fn rejects_impossible_geometry() {
        let mut config = Config::default();
        config.capture.buffer_size = 16;
        assert!(matches!(config.validate(), Err(InitError::Invalid(_))));

        let mut config = Config::default();
        config.capture.event_queue_depth = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(InitError::Config(_))));
    }
}
