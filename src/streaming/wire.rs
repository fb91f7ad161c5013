//! Wire protocol for frame and detection messages
//!
//! # Frame message
//!
//! ```text
//! ┌───────────────────────────┬──────────────────┬──────────────────────┐
//! │ Magic (8 bytes)           │ Length (4 bytes) │ Payload              │
//! │ 99 C3 E3 C5 EF E5 58 37   │ Big-endian u32   │ JPEG or PNG image    │
//! └───────────────────────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! # Detection message
//!
//! ```text
//! ┌───────────────┬─────────────────┬───────────────────────────────┐
//! │ Magic (4)     │ Count (2 bytes) │ Count × 14-byte records       │
//! │ D5 89 62 68   │ Big-endian u16  │ see [`MatchData::to_bytes`]   │
//! └───────────────┴─────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Error handling
//!
//! Decoders return `Ok(None)` for anything that is not a well-formed message:
//! wrong magic, peer closed mid-message, oversized length, undecodable image.
//! The caller then runs the matching salvage function, which discards bytes
//! until the stream is positioned at the next magic. Socket errors (including
//! read timeouts) are returned as `Err`.
//!
//! A mismatched magic is only peeked, never consumed, so a message preceded by
//! fewer garbage bytes than its magic is still found by salvage.

use super::buffered_socket::BufferedSocket;
use crate::detection::MatchData;
use crate::error::Result;
use crate::frame::Frame;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Leading bytes of every frame message
pub const FRAME_MAGIC: [u8; 8] = [0x99, 0xC3, 0xE3, 0xC5, 0xEF, 0xE5, 0x58, 0x37];

/// Leading bytes of every detection message
pub const DATA_MAGIC: [u8; 4] = [0xD5, 0x89, 0x62, 0x68];

/// Frame payloads above this are treated as corruption
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024 * 1024;

/// Default JPEG quality. Very low: tiny packets at the cost of image quality.
pub const DEFAULT_JPEG_QUALITY: u8 = 9;

/// Image codec used for frame payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FrameCodec {
    /// Lossy, quality 1-100
    Jpeg { quality: u8 },
    /// Lossless
    Png,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Encode a frame message
pub fn encode_frame(frame: &Frame, codec: FrameCodec) -> Result<Vec<u8>> {
    let image = DynamicImage::ImageRgb8(frame.to_rgb_image());
    let mut payload = Vec::new();
    match codec {
        FrameCodec::Jpeg { quality } => {
            let encoder = JpegEncoder::new_with_quality(&mut payload, quality.clamp(1, 100));
            image.write_with_encoder(encoder)?;
        }
        FrameCodec::Png => {
            image.write_with_encoder(PngEncoder::new(&mut payload))?;
        }
    }

    let mut msg = Vec::with_capacity(FRAME_MAGIC.len() + 4 + payload.len());
    msg.extend_from_slice(&FRAME_MAGIC);
    msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    msg.extend_from_slice(&payload);
    Ok(msg)
}

/// Decode one frame message. `Ok(None)` means parse failure.
pub fn decode_frame<S: Read>(sock: &mut BufferedSocket<S>) -> Result<Option<Frame>> {
    if !take_magic(sock, &FRAME_MAGIC)? {
        return Ok(None);
    }

    let Some(length) = sock.read_array::<4>()? else {
        return Ok(None);
    };
    let length = u32::from_be_bytes(length) as usize;
    if length > MAX_FRAME_PAYLOAD {
        log::warn!("Frame payload too large: {} bytes", length);
        return Ok(None);
    }

    let Some(payload) = sock.read(length)? else {
        return Ok(None);
    };
    match image::load_from_memory(&payload) {
        Ok(image) => Ok(Some(Frame::from_rgb_image(&image.to_rgb8()))),
        Err(e) => {
            log::debug!("Undecodable frame payload ({} bytes): {}", length, e);
            Ok(None)
        }
    }
}

/// Encode a detection message
pub fn encode_detections(matches: &[MatchData]) -> Vec<u8> {
    // the count field is u16; anything beyond is dropped
    let count = matches.len().min(u16::MAX as usize);
    let mut msg = Vec::with_capacity(DATA_MAGIC.len() + 2 + count * MatchData::BYTE_LENGTH);
    msg.extend_from_slice(&DATA_MAGIC);
    msg.extend_from_slice(&(count as u16).to_be_bytes());
    for m in &matches[..count] {
        msg.extend_from_slice(&m.to_bytes());
    }
    msg
}

/// Decode one detection message. `Ok(None)` means parse failure.
pub fn decode_detections<S: Read>(sock: &mut BufferedSocket<S>) -> Result<Option<Vec<MatchData>>> {
    if !take_magic(sock, &DATA_MAGIC)? {
        return Ok(None);
    }

    let Some(count) = sock.read_array::<2>()? else {
        return Ok(None);
    };
    let count = u16::from_be_bytes(count) as usize;

    let mut matches = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(record) = sock.read_array::<{ MatchData::BYTE_LENGTH }>()? else {
            return Ok(None);
        };
        match MatchData::from_bytes(&record) {
            Some(m) => matches.push(m),
            None => return Ok(None),
        }
    }
    Ok(Some(matches))
}

/// Consume `magic` if the stream is positioned at it. Leaves the stream
/// untouched otherwise.
fn take_magic<S: Read>(sock: &mut BufferedSocket<S>, magic: &[u8]) -> Result<bool> {
    let at_magic = sock.peek(magic.len())?.is_some_and(|bytes| bytes == magic);
    if at_magic {
        sock.read(magic.len())?;
    }
    Ok(at_magic)
}

/// Skip bytes until the stream is positioned at `magic`.
///
/// Returns `Ok(false)` if the peer closed first.
fn salvage<S: Read>(sock: &mut BufferedSocket<S>, magic: &[u8]) -> Result<bool> {
    let mut skipped = 0usize;
    loop {
        let at_magic = sock.peek(magic.len())?.map(|bytes| bytes == magic);
        match at_magic {
            None => {
                log::debug!("Salvage failed after skipping {} bytes", skipped);
                return Ok(false);
            }
            Some(true) => {
                if skipped > 0 {
                    log::debug!("Stream salvaged after skipping {} bytes", skipped);
                }
                return Ok(true);
            }
            Some(false) => {
                sock.read(1)?;
                skipped += 1;
            }
        }
    }
}

/// Resynchronize a frame stream on the next [`FRAME_MAGIC`]
pub fn salvage_frame_stream<S: Read>(sock: &mut BufferedSocket<S>) -> Result<bool> {
    salvage(sock, &FRAME_MAGIC)
}

/// Resynchronize a detection stream on the next [`DATA_MAGIC`]
pub fn salvage_data_stream<S: Read>(sock: &mut BufferedSocket<S>) -> Result<bool> {
    salvage(sock, &DATA_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn socket(bytes: Vec<u8>) -> BufferedSocket<std::io::Cursor<Vec<u8>>> {
        BufferedSocket::new(std::io::Cursor::new(bytes))
    }

    fn gradient(width: u32, height: u32) -> Frame {
        let mut frame = Frame::filled(width, height, [0, 0, 0]);
        for y in 0..height {
            for x in 0..width {
                frame.set_pixel(x, y, [(x * 7) as u8, (y * 11) as u8, ((x + y) * 3) as u8]);
            }
        }
        frame
    }

    #[test]
    fn test_frame_header() {
        let msg = encode_frame(&gradient(8, 8), FrameCodec::Png).unwrap();
        assert_eq!(&msg[..8], &FRAME_MAGIC);
        let length = u32::from_be_bytes([msg[8], msg[9], msg[10], msg[11]]) as usize;
        assert_eq!(length, msg.len() - 12);
    }

    #[test]
    fn test_png_frame_is_lossless() {
        let frame = gradient(40, 30);
        let msg = encode_frame(&frame, FrameCodec::Png).unwrap();
        let decoded = decode_frame(&mut socket(msg)).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_jpeg_frame_keeps_dimensions() {
        let frame = gradient(64, 48);
        let msg = encode_frame(&frame, FrameCodec::default()).unwrap();
        let decoded = decode_frame(&mut socket(msg)).unwrap().unwrap();
        assert_eq!(decoded.size(), (64, 48));
    }

    #[test]
    fn test_frame_bad_magic_is_parse_failure() {
        let mut msg = encode_frame(&gradient(4, 4), FrameCodec::Png).unwrap();
        msg[0] ^= 0xFF;
        assert!(decode_frame(&mut socket(msg)).unwrap().is_none());
    }

    #[test]
    fn test_frame_truncated_is_parse_failure() {
        let mut msg = encode_frame(&gradient(4, 4), FrameCodec::Png).unwrap();
        msg.truncate(msg.len() - 3);
        assert!(decode_frame(&mut socket(msg)).unwrap().is_none());
    }

    #[test]
    fn test_frame_oversized_length_is_parse_failure() {
        let mut msg = FRAME_MAGIC.to_vec();
        msg.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_frame(&mut socket(msg)).unwrap().is_none());
    }

    #[test]
    fn test_detections_preserve_order_and_fields() {
        let matches = vec![
            MatchData::new(1.5, -0.25, 4.0, true, Some(12)),
            MatchData::new(-3.0, 0.5, 0.75, false, None),
            MatchData::new(0.0, 0.0, 1.0, true, Some(255)),
        ];
        let msg = encode_detections(&matches);
        assert_eq!(&msg[..4], &DATA_MAGIC);
        assert_eq!(&msg[4..6], &[0, 3]);
        assert_eq!(msg.len(), 6 + 3 * MatchData::BYTE_LENGTH);

        let decoded = decode_detections(&mut socket(msg)).unwrap().unwrap();
        assert_eq!(decoded, matches);
        assert_eq!(decoded[1].fiducial_id, None);
    }

    #[test]
    fn test_empty_detection_list() {
        let msg = encode_detections(&[]);
        assert_eq!(msg.len(), 6);
        assert_eq!(decode_detections(&mut socket(msg)).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_detections_short_record_is_parse_failure() {
        let mut msg = encode_detections(&[MatchData::new(1.0, 1.0, 1.0, true, None)]);
        msg.pop();
        assert!(decode_detections(&mut socket(msg)).unwrap().is_none());
    }

    #[test]
    fn test_salvage_after_random_garbage() {
        let mut rng = StdRng::seed_from_u64(7);
        let matches = vec![MatchData::new(0.5, 0.5, 2.0, true, Some(4))];

        // every length up to the magic's own, then random longer runs
        let lengths: Vec<usize> = (1..=DATA_MAGIC.len())
            .chain((0..20).map(|_| rng.random_range(5..200)))
            .collect();
        for garbage_len in lengths {
            let mut stream: Vec<u8> = (0..garbage_len).map(|_| rng.random()).collect();
            stream[0] = 0x11;
            stream.extend_from_slice(&encode_detections(&matches));

            let mut sock = socket(stream);
            let first = decode_detections(&mut sock).unwrap();
            let decoded = match first {
                Some(decoded) => decoded,
                None => {
                    assert!(salvage_data_stream(&mut sock).unwrap());
                    decode_detections(&mut sock).unwrap().unwrap()
                }
            };
            assert_eq!(decoded, matches);
        }
    }

    #[test]
    fn test_short_garbage_before_frame_is_salvaged() {
        let frame = gradient(5, 5);
        for garbage_len in 1..=FRAME_MAGIC.len() {
            let mut stream = vec![0x11; garbage_len];
            stream.extend_from_slice(&encode_frame(&frame, FrameCodec::Png).unwrap());

            let mut sock = socket(stream);
            assert!(decode_frame(&mut sock).unwrap().is_none());
            assert!(salvage_frame_stream(&mut sock).unwrap());
            let decoded = decode_frame(&mut sock).unwrap();
            assert_eq!(decoded.as_ref(), Some(&frame), "garbage_len={}", garbage_len);
        }
    }

    #[test]
    fn test_mismatched_magic_is_not_consumed() {
        let msg = encode_detections(&[MatchData::new(1.0, 2.0, 3.0, false, None)]);
        let mut sock = socket(msg.clone());
        assert!(decode_frame(&mut sock).unwrap().is_none());
        assert_eq!(sock.buffered(), msg.len());
        assert_eq!(decode_detections(&mut sock).unwrap().map(|m| m.len()), Some(1));
    }

    #[test]
    fn test_salvage_frame_stream() {
        let frame = gradient(6, 6);
        let mut stream = vec![0x99, 0xC3, 0x00, 0x13, 0x37, 0x42, 0x99, 0xC3, 0xE3];
        stream.extend_from_slice(&encode_frame(&frame, FrameCodec::Png).unwrap());

        let mut sock = socket(stream);
        assert!(decode_frame(&mut sock).unwrap().is_none());
        assert!(salvage_frame_stream(&mut sock).unwrap());
        assert_eq!(decode_frame(&mut sock).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_salvage_fails_on_closed_stream() {
        let mut sock = socket(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(!salvage_frame_stream(&mut sock).unwrap());
        let mut sock = socket(Vec::new());
        assert!(!salvage_data_stream(&mut sock).unwrap());
    }
}
