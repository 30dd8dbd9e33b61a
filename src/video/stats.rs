//! Pipeline statistics and frame rate measurement

use std::time::{Duration, Instant};

/// Video pipeline statistics
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Total bytes read from the video stream
    pub bytes_received: u64,
    /// Bytes discarded before the first start code
    pub bytes_dropped: u64,
    /// Complete access units handed to the decoder
    pub access_units: u64,
    /// NAL units discarded as malformed
    pub nal_units_dropped: u64,
    /// Total frames decoded
    pub frames_decoded: u64,
    /// Access units the decoder rejected
    pub decode_errors: u64,
    /// Number of resolution transitions observed
    pub resolution_changes: u64,
    /// Average decode time per access unit in milliseconds
    pub avg_decode_time_ms: f64,
    /// Sequence number of the last published frame
    pub last_sequence: u64,
}

impl PipelineStats {
    /// Returns the decode success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.access_units == 0 {
            return 100.0;
        }
        let decoded = self.access_units.saturating_sub(self.decode_errors);
        (decoded as f64 / self.access_units as f64) * 100.0
    }

    /// Returns the average access unit size in bytes
    pub fn avg_unit_size(&self) -> f64 {
        if self.access_units == 0 {
            return 0.0;
        }
        (self.bytes_received - self.bytes_dropped) as f64 / self.access_units as f64
    }
}

/// Counts frames over a fixed window
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window: Duration,
    window_start: Instant,
    frames: u32,
    fps: u32,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsCounter {
    /// Creates a counter with a one second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    /// Creates a counter with a custom window
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            window_start: Instant::now(),
            frames: 0,
            fps: 0,
        }
    }

    /// Records a frame, returning the new rate when a window completes
    pub fn tick(&mut self) -> Option<u32> {
        self.tick_at(Instant::now())
    }

    /// Records a frame observed at `now`
    pub fn tick_at(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }

        self.fps = (self.frames as f64 / elapsed.as_secs_f64()).round() as u32;
        self.frames = 0;
        self.window_start = now;
        Some(self.fps)
    }

    /// Rate measured over the last completed window
    pub fn fps(&self) -> u32 {
        self.fps
    }
}
