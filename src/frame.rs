//! Frame container shared by cameras, the wire codec and stream clients.
//!
//! Frames are dense `height × width × 3` byte images in BGR channel order.
//! Producers replace their current frame wholesale and hand out `Arc<Frame>`
//! snapshots, so a reader's copy stays valid no matter what the capture
//! thread does next.

use crate::error::{Error, Result};
use image::RgbImage;
use image::imageops::{self, FilterType};
use std::fmt;

/// Bytes per pixel (B, G, R)
pub const CHANNELS: usize = 3;

/// A single captured image in BGR order
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap raw BGR bytes, checking that the buffer matches the dimensions
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "{}x{} frame needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame with every pixel set to one BGR color
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// (width, height) in pixels
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw BGR bytes, row-major
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * CHANNELS)
    }

    /// BGR value at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let i = self.offset(x, y)?;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    /// Overwrite the BGR value at (x, y); out-of-bounds writes are ignored
    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        if let Some(i) = self.offset(x, y) {
            self.data[i..i + CHANNELS].copy_from_slice(&bgr);
        }
    }

    /// Convert to an RGB image for encoding
    pub fn to_rgb_image(&self) -> RgbImage {
        let mut img = RgbImage::new(self.width, self.height);
        for (dst, src) in img
            .chunks_exact_mut(CHANNELS)
            .zip(self.data.chunks_exact(CHANNELS))
        {
            dst[0] = src[2];
            dst[1] = src[1];
            dst[2] = src[0];
        }
        img
    }

    /// Build a BGR frame from a decoded RGB image
    pub fn from_rgb_image(img: &RgbImage) -> Self {
        let (width, height) = img.dimensions();
        let mut data = Vec::with_capacity(img.as_raw().len());
        for px in img.as_raw().chunks_exact(CHANNELS) {
            data.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Downsample (or upsample) to the given size
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if (width, height) == self.size() {
            return self.clone();
        }
        let scaled = imageops::resize(&self.to_rgb_image(), width, height, FilterType::Triangle);
        Self::from_rgb_image(&scaled)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_length() {
        assert!(Frame::new(4, 2, vec![0; 24]).is_ok());
        assert!(matches!(
            Frame::new(4, 2, vec![0; 23]),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_pixel_access() {
        let mut frame = Frame::filled(3, 2, [1, 2, 3]);
        assert_eq!(frame.pixel(2, 1), Some([1, 2, 3]));
        assert_eq!(frame.pixel(3, 0), None);

        frame.set_pixel(0, 1, [9, 8, 7]);
        assert_eq!(frame.pixel(0, 1), Some([9, 8, 7]));
        assert_eq!(&frame.as_bytes()[9..12], &[9, 8, 7]);
    }

    #[test]
    fn test_rgb_conversion_swaps_channels() {
        let frame = Frame::filled(2, 2, [10, 20, 30]);
        let rgb = frame.to_rgb_image();
        assert_eq!(rgb.get_pixel(1, 1).0, [30, 20, 10]);
        assert_eq!(Frame::from_rgb_image(&rgb), frame);
    }

    #[test]
    fn test_resized() {
        let frame = Frame::filled(64, 48, [0, 128, 255]);
        let small = frame.resized(32, 24);
        assert_eq!(small.size(), (32, 24));
        assert_eq!(small.pixel(10, 10), Some([0, 128, 255]));
    }
}
