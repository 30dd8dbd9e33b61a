//! Elementary stream to decoded frames
//!
//! `VideoPipeline` owns the parser and decoder for one session. It numbers
//! frames and reports a resolution change ahead of the first frame that
//! no longer matches the current resolution.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::error::VideoResult;
use crate::video::decoder::FrameDecoder;
use crate::video::parser::AccessUnitParser;
use crate::video::stats::PipelineStats;
use crate::video::types::{DecodedFrame, Resolution};

/// Output of the pipeline, in publish order
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Frames from now on have this resolution
    Resized(Resolution),
    /// A decoded picture
    Frame(DecodedFrame),
}

/// Parser, decoder and resolution tracking for one video stream
pub struct VideoPipeline {
    parser: AccessUnitParser,
    decoder: Box<dyn FrameDecoder>,
    resolution: Option<Resolution>,
    next_sequence: u64,
    stats: Arc<RwLock<PipelineStats>>,
    decode_time_total_ms: f64,
}

impl VideoPipeline {
    /// Creates a pipeline seeded with the resolution announced at handshake
    pub fn new(decoder: Box<dyn FrameDecoder>, resolution: Option<Resolution>) -> Self {
        Self {
            parser: AccessUnitParser::new(),
            decoder,
            resolution,
            next_sequence: 1,
            stats: Arc::new(RwLock::new(PipelineStats::default())),
            decode_time_total_ms: 0.0,
        }
    }

    /// Shares statistics with an outside observer
    pub fn with_stats(mut self, stats: Arc<RwLock<PipelineStats>>) -> Self {
        self.stats = stats;
        self
    }

    /// Feeds freshly read bytes
    ///
    /// Chunk boundaries are irrelevant. Units the decoder rejects are
    /// dropped and counted.
    ///
    /// # Errors
    ///
    /// Returns only fatal decoder errors
    pub fn feed(&mut self, data: &[u8]) -> VideoResult<Vec<PipelineEvent>> {
        let dropped_bytes = self.parser.dropped_bytes();
        let dropped_nals = self.parser.dropped_nal_units();
        let units = self.parser.feed(data);

        if let Ok(mut stats) = self.stats.write() {
            stats.bytes_received += data.len() as u64;
            stats.bytes_dropped += self.parser.dropped_bytes() - dropped_bytes;
            stats.nal_units_dropped += self.parser.dropped_nal_units() - dropped_nals;
        }

        self.decode_units(units)
    }

    /// Decodes whatever the parser still buffers
    ///
    /// Used when the stream ends so the final unit is not lost.
    pub fn flush(&mut self) -> VideoResult<Vec<PipelineEvent>> {
        let units = self.parser.flush();
        self.decode_units(units)
    }

    /// Returns the last published resolution
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    /// Returns a snapshot of the statistics
    pub fn stats(&self) -> PipelineStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn decode_units(&mut self, units: Vec<Bytes>) -> VideoResult<Vec<PipelineEvent>> {
        let mut events = Vec::new();

        for unit in units {
            let start = Instant::now();
            let result = self.decoder.decode(&unit);
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

            let frames = match result {
                Ok(frames) => frames,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Dropping access unit of {} bytes: {}", unit.len(), e);
                    self.update_stats(elapsed_ms, true);
                    continue;
                }
            };
            self.update_stats(elapsed_ms, false);
            trace!("Decoded unit of {} bytes into {} frame(s)", unit.len(), frames.len());

            for frame in frames {
                self.publish(frame, &mut events);
            }
        }

        Ok(events)
    }

    fn publish(&mut self, mut frame: DecodedFrame, events: &mut Vec<PipelineEvent>) {
        let resolution = frame.resolution();
        if self.resolution != Some(resolution) {
            match self.resolution {
                Some(previous) => info!("Resolution changed: {} -> {}", previous, resolution),
                None => info!("Resolution: {}", resolution),
            }
            self.resolution = Some(resolution);
            if let Ok(mut stats) = self.stats.write() {
                stats.resolution_changes += 1;
            }
            events.push(PipelineEvent::Resized(resolution));
        }

        frame.sequence = self.next_sequence;
        self.next_sequence += 1;
        if let Ok(mut stats) = self.stats.write() {
            stats.frames_decoded += 1;
            stats.last_sequence = frame.sequence;
        }
        events.push(PipelineEvent::Frame(frame));
    }

    fn update_stats(&mut self, elapsed_ms: f64, failed: bool) {
        let Ok(mut stats) = self.stats.write() else {
            return;
        };

        stats.access_units += 1;
        if failed {
            stats.decode_errors += 1;
            return;
        }

        self.decode_time_total_ms += elapsed_ms;
        let decoded = stats.access_units - stats.decode_errors;
        stats.avg_decode_time_ms = self.decode_time_total_ms / decoded as f64;
        if decoded % 300 == 0 {
            debug!(
                "Decoded {} units, avg {:.2}ms per unit",
                decoded, stats.avg_decode_time_ms
            );
        }
    }
}
