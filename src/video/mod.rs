//! H.264 video pipeline
//!
//! This module turns the raw elementary stream read from the video
//! connection into decoded frames:
//! - Access unit reconstruction from arbitrary chunks
//! - Decoding behind the `FrameDecoder` trait (OpenH264 in production)
//! - Resolution change detection and frame numbering
//! - A dedicated decode thread fed by an ordered queue

pub mod decoder;
pub mod parser;
pub mod pipeline;
pub mod stats;
pub mod types;
pub mod worker;

pub use decoder::{h264_decoder_factory, DecoderFactory, FrameDecoder, H264Decoder};
pub use parser::AccessUnitParser;
pub use pipeline::{PipelineEvent, VideoPipeline};
pub use stats::{FpsCounter, PipelineStats};
pub use types::{DecodedFrame, Resolution};
pub use worker::{ChunkSender, DecodeWorker, FatalErrorHandler, PipelineSink};
