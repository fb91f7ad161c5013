//! vistream - camera frame and detection streaming for robot vision processors
//!
//! A camera thread keeps the latest frame, a [`MatchStream`](streaming::MatchStream)
//! runs an optional detector over each new frame and broadcasts both the frame
//! and the detections to TCP subscribers. Stream clients keep the latest
//! message received.
//!
//! ```text
//! Camera ──▶ ProcessedCamera ──▶ MatchStream ──frames──────▶ FrameStreamClient
//!                                    │  └──────detections──▶ MatchDataStreamClient
//!                                SocketPool
//! ```

pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod streaming;

// Re-export commonly used types
pub use camera::{Camera, FrameId, FrameSource, ProcessedCamera};
pub use config::AppConfig;
pub use detection::{DetectionKind, MatchContext, MatchData};
pub use error::{Error, Result};
pub use frame::Frame;
pub use streaming::{FrameStreamClient, MatchDataStreamClient, MatchStream, SocketPool};
