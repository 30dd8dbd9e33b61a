//! Video types and data structures
//!
//! This module defines the types shared by the parser, decoder and
//! pipeline.

use std::fmt;
use std::time::Instant;

/// Video dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Creates a new resolution
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns width / height, or 0.0 for an empty resolution
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded picture in planar YUV 4:2:0
///
/// Planes are tightly packed: the luma plane holds `width * height` bytes
/// and each chroma plane `chroma_width() * chroma_height()` bytes.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Luma plane
    pub y: Vec<u8>,
    /// Cb plane
    pub u: Vec<u8>,
    /// Cr plane
    pub v: Vec<u8>,
    /// Sequence number, starting at 1 for each session
    pub sequence: u64,
    /// When the frame left the decoder
    pub timestamp: Instant,
}

impl DecodedFrame {
    /// Creates a new frame; the pipeline assigns the sequence number
    pub fn new(width: u32, height: u32, y: Vec<u8>, u: Vec<u8>, v: Vec<u8>) -> Self {
        Self {
            width,
            height,
            y,
            u,
            v,
            sequence: 0,
            timestamp: Instant::now(),
        }
    }

    /// Creates a frame filled with a single luma value and neutral chroma
    pub fn filled(width: u32, height: u32, luma: u8) -> Self {
        let chroma_len = (Self::half(width) * Self::half(height)) as usize;
        Self::new(
            width,
            height,
            vec![luma; (width * height) as usize],
            vec![128; chroma_len],
            vec![128; chroma_len],
        )
    }

    /// Returns the frame dimensions
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Width of the chroma planes
    pub fn chroma_width(&self) -> u32 {
        Self::half(self.width)
    }

    /// Height of the chroma planes
    pub fn chroma_height(&self) -> u32 {
        Self::half(self.height)
    }

    /// Returns the size of the pixel data in bytes
    pub fn size_bytes(&self) -> usize {
        self.y.len() + self.u.len() + self.v.len()
    }

    /// Validates that the plane sizes match the dimensions
    pub fn is_valid(&self) -> bool {
        let luma = (self.width * self.height) as usize;
        let chroma = (self.chroma_width() * self.chroma_height()) as usize;
        self.y.len() == luma && self.u.len() == chroma && self.v.len() == chroma
    }

    fn half(n: u32) -> u32 {
        n.div_ceil(2)
    }
}
