//! Error types for vistream

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// vistream error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encode/decode error
    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Stream constructed without a socket pool
    #[error("Socket pool not initialized")]
    MissingSocketPool,

    /// Frame rate must be positive
    #[error("Target frame rate must be positive ({0})")]
    InvalidFrameRate(f64),

    /// Buffer size must be positive
    #[error("Invalid buffer size {0}")]
    InvalidBufferSize(usize),

    /// Frame dimensions and data disagree
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Worker already started
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Worker was stopped and cannot be restarted
    #[error("Cannot restart a terminated {0}")]
    Terminated(&'static str),

    /// Requested port is allocated or failed to bind
    #[error("Port {0} is not available")]
    PortUnavailable(u16),

    /// Requested port is outside the managed range
    #[error("Port {0} is outside the managed range")]
    PortOutOfRange(u16),

    /// Every port in the pool is allocated
    #[error("Out of valid sockets")]
    PoolExhausted,

    /// No camera device left to claim
    #[error("No known devices available")]
    NoDeviceAvailable,

    /// Requested camera device is unknown or already claimed
    #[error("Camera device {0} is not available")]
    DeviceUnavailable(u32),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
