//! TCP streaming of frames and detections
//!
//! | Module | Role |
//! |--------|------|
//! | [`buffered_socket`] | Buffered peek/read/write over a socket |
//! | [`wire`] | Message encoding, decoding and stream salvage |
//! | [`socket_pool`] | Allocation of listening ports |
//! | [`server`] | [`MatchStream`] broadcast server |
//! | [`client`] | Background stream readers |

pub mod buffered_socket;
pub mod client;
pub mod server;
pub mod socket_pool;
pub mod wire;

pub use buffered_socket::BufferedSocket;
pub use client::{FrameStreamClient, MatchDataStreamClient, StreamClient, StreamMessage};
pub use server::{MatchStream, MatchStreamBuilder, MatchVisualizer, Matcher};
pub use socket_pool::SocketPool;
pub use wire::{DATA_MAGIC, FRAME_MAGIC, FrameCodec};
