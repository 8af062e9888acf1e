//! Gapless playback scheduling
//!
//! Each chunk starts where the previous one ends. When playback has run dry
//! the cursor jumps forward to the current clock instead of scheduling into
//! the past.

/// Monotonic start-time cursor on the playback clock, in seconds
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PlaybackScheduler {
    cursor: f64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `duration` seconds of playback and return the start time
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        if self.cursor < now {
            self.cursor = now;
        }
        let start = self.cursor;
        self.cursor += duration;
        start
    }

    /// Time at which the last scheduled chunk finishes
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Forget scheduled audio, e.g. after the output was closed
    pub fn reset(&mut self) {
        self.cursor = 0.0;
    }
}

/// Duration in seconds of `samples` mono samples at `sample_rate`
pub fn chunk_duration(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 / f64::from(sample_rate.max(1))
}
