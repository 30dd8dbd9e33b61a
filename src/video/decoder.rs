//! Access unit decoding
//!
//! `FrameDecoder` is the seam between the pipeline and the codec. The
//! production implementation wraps OpenH264; decoders are created on the
//! decode worker thread through a `DecoderFactory` and never leave it.

use std::sync::Arc;

use openh264::decoder::{DecodedYUV, Decoder};
use openh264::formats::YUVSource;
use tracing::debug;

use crate::error::{VideoError, VideoResult};
use crate::video::types::DecodedFrame;

/// Decodes complete access units into pictures
pub trait FrameDecoder {
    /// Decodes one access unit
    ///
    /// May return no frame (the decoder is buffering) or frames belonging to
    /// earlier units. `VideoError::DecodeFailed` drops only this unit.
    fn decode(&mut self, unit: &[u8]) -> VideoResult<Vec<DecodedFrame>>;

    /// Codec name for logs
    fn name(&self) -> &'static str;
}

/// Creates a decoder on the thread that will own it
pub type DecoderFactory = Arc<dyn Fn() -> VideoResult<Box<dyn FrameDecoder>> + Send + Sync>;

/// Returns a factory producing OpenH264 decoders
pub fn h264_decoder_factory() -> DecoderFactory {
    Arc::new(|| Ok(Box::new(H264Decoder::new()?) as Box<dyn FrameDecoder>))
}

/// H.264 decoder backed by OpenH264
pub struct H264Decoder {
    decoder: Decoder,
}

impl H264Decoder {
    /// Creates a new decoder
    ///
    /// # Errors
    ///
    /// Returns `VideoError::DecoderInit` if OpenH264 cannot be initialized
    pub fn new() -> VideoResult<Self> {
        let decoder = Decoder::new().map_err(|e| VideoError::DecoderInit(e.to_string()))?;
        debug!("OpenH264 decoder initialized");
        Ok(Self { decoder })
    }
}

impl FrameDecoder for H264Decoder {
    fn decode(&mut self, unit: &[u8]) -> VideoResult<Vec<DecodedFrame>> {
        match self.decoder.decode(unit) {
            Ok(Some(yuv)) => Ok(vec![frame_from_yuv(&yuv)]),
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(VideoError::DecodeFailed(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "h264"
    }
}

/// Copies the decoder-owned planes into a tightly packed frame
fn frame_from_yuv(yuv: &DecodedYUV<'_>) -> DecodedFrame {
    let (width, height) = yuv.dimensions();
    let (y_stride, u_stride, v_stride) = yuv.strides();
    let (chroma_width, chroma_height) = (width.div_ceil(2), height.div_ceil(2));

    DecodedFrame::new(
        width as u32,
        height as u32,
        copy_plane(yuv.y(), y_stride, width, height),
        copy_plane(yuv.u(), u_stride, chroma_width, chroma_height),
        copy_plane(yuv.v(), v_stride, chroma_width, chroma_height),
    )
}

/// Removes row padding from a strided plane
fn copy_plane(src: &[u8], stride: usize, width: usize, height: usize) -> Vec<u8> {
    let mut plane = Vec::with_capacity(width * height);
    for row in src.chunks(stride).take(height) {
        plane.extend_from_slice(&row[..width.min(row.len())]);
    }
    plane
}
