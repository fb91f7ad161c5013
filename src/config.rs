//! Configuration for the vistream daemon
//!
//! Loaded from a TOML file. Every section has defaults, so a partial file
//! (or none at all) is valid.

use crate::error::{Error, Result};
use crate::streaming::FrameCodec;
use crate::streaming::buffered_socket::DEFAULT_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub detector: DetectorConfig,
    pub logging: LoggingConfig,
}

/// Port range shared by all streams
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Interface listeners bind on
    pub host: String,
    /// First port of the range (inclusive)
    pub start: u16,
    /// Last port of the range (inclusive)
    pub end: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            start: 1180,
            end: 1190,
        }
    }
}

/// Capture device selection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device indices known to exist
    pub devices: Vec<u32>,
    /// Device to open; lowest free device if unset
    pub device: Option<u32>,
    pub width: u32,
    pub height: u32,
    /// Capture rate of the test pattern device
    pub fps: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            devices: vec![0],
            device: None,
            width: 640,
            height: 480,
            fps: 30.0,
        }
    }
}

/// Match stream options
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frame port; lowest free port if unset
    pub port: Option<u16>,
    /// Detection port; `port + 1` (or lowest free) if unset
    pub detection_port: Option<u16>,
    /// Downsample frames to this size before sending
    pub output_width: Option<u32>,
    pub output_height: Option<u32>,
    /// Maximum frames per second sent to frame clients
    pub rate: Option<f64>,
    /// Per-subscriber socket buffer size
    pub buffer_size: usize,
    pub codec: FrameCodec,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: Some(1180),
            detection_port: None,
            output_width: Some(320),
            output_height: Some(240),
            rate: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            codec: FrameCodec::default(),
        }
    }
}

impl StreamConfig {
    /// Output size, if both dimensions are set
    pub fn output_size(&self) -> Option<(u32, u32)> {
        self.output_width.zip(self.output_height)
    }
}

/// Detector selection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Publish random detections for client testing
    pub demo: bool,
    /// Upper bound on demo detections per frame
    pub max_count: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            demo: false,
            max_count: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter (trace, debug, info, warn, error); `RUST_LOG` wins
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    ///
    /// # Example
    /// ```no_run
    /// use vistream::config::AppConfig;
    ///
    /// let config = AppConfig::from_file("vistream.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings no component would accept
    pub fn validate(&self) -> Result<()> {
        if self.pool.start > self.pool.end {
            return Err(Error::Config(format!(
                "pool range is empty ({}..={})",
                self.pool.start, self.pool.end
            )));
        }
        let range = self.pool.start..=self.pool.end;
        for port in [self.stream.port, self.stream.detection_port].into_iter().flatten() {
            if !range.contains(&port) {
                return Err(Error::PortOutOfRange(port));
            }
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(Error::Config(format!(
                "camera size must be non-zero ({}x{})",
                self.camera.width, self.camera.height
            )));
        }
        if self.camera.fps.is_nan() || self.camera.fps <= 0.0 {
            return Err(Error::InvalidFrameRate(self.camera.fps));
        }
        if let Some(device) = self.camera.device
            && !self.camera.devices.contains(&device)
        {
            return Err(Error::DeviceUnavailable(device));
        }
        if self.stream.output_width.is_some() != self.stream.output_height.is_some() {
            return Err(Error::Config(
                "output_width and output_height must be set together".to_string(),
            ));
        }
        if let Some((0, _) | (_, 0)) = self.stream.output_size() {
            return Err(Error::Config("output size must be non-zero".to_string()));
        }
        if let Some(rate) = self.stream.rate
            && (rate.is_nan() || rate <= 0.0)
        {
            return Err(Error::InvalidFrameRate(rate));
        }
        if let FrameCodec::Jpeg { quality } = self.stream.codec
            && !(1..=100).contains(&quality)
        {
            return Err(Error::Config(format!(
                "jpeg quality must be within 1..=100 ({})",
                quality
            )));
        }
        if self.stream.buffer_size == 0 {
            return Err(Error::InvalidBufferSize(0));
        }
        Ok(())
    }
}
