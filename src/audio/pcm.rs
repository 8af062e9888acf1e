//! PCM conversion and capture framing
//!
//! The wire format on both directions is mono signed 16-bit little-endian
//! PCM. Capture accumulates float samples into fixed-size frames and only
//! forwards completed frames while streaming is enabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::events::{AudioEvent, EventBus};

/// Convert one float sample to 16-bit PCM
///
/// Values are clamped to [-1, 1]; negatives scale by 32768 and positives
/// by 32767 so neither extreme overflows.
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Convert one 16-bit PCM sample back to float, inverse of [`f32_to_i16`]
pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        f32::from(sample) / 32768.0
    } else {
        f32::from(sample) / 32767.0
    }
}

/// Encode samples as little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian PCM bytes into float samples
///
/// Returns `None` for an odd byte count.
pub fn bytes_to_f32(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
            .collect(),
    )
}

/// One completed capture frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position of this frame in the capture stream, counting dropped frames
    pub sequence: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Wire bytes of this frame
    pub fn to_bytes(&self) -> Vec<u8> {
        samples_to_bytes(&self.samples)
    }
}

/// Capture-side processing: frame assembly, conversion and gating
///
/// Owned by the audio backend's capture callback.
pub struct CaptureGraph {
    frame_samples: usize,
    pending: Vec<f32>,
    sequence: u64,
    was_streaming: bool,
    streaming: Arc<AtomicBool>,
    events: EventBus<AudioEvent>,
}

impl CaptureGraph {
    pub(crate) fn new(
        frame_samples: usize,
        streaming: Arc<AtomicBool>,
        events: EventBus<AudioEvent>,
    ) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
            sequence: 0,
            was_streaming: false,
            streaming,
            events,
        }
    }

    /// Bus that captured frames are published on
    #[cfg_attr(not(feature = "hardware"), allow(dead_code))]
    pub(crate) fn events(&self) -> EventBus<AudioEvent> {
        self.events.clone()
    }

    /// Feed native float samples from the microphone
    pub fn push(&mut self, samples: &[f32]) {
        let streaming = self.streaming.load(Ordering::SeqCst);
        if streaming && !self.was_streaming {
            // Partial frame predates the start of streaming
            self.pending.clear();
        }
        self.was_streaming = streaming;

        for &sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.frame_samples {
                self.complete_frame();
            }
        }
    }

    fn complete_frame(&mut self) {
        let sequence = self.sequence;
        self.sequence += 1;

        if !self.streaming.load(Ordering::SeqCst) {
            trace!(sequence, "frame dropped, not streaming");
            self.pending.clear();
            return;
        }

        let samples = self.pending.drain(..).map(f32_to_i16).collect();
        self.events
            .publish(AudioEvent::Frame(AudioFrame { sequence, samples }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_tolerance() {
        let input = [-1.0f32, -0.75, -0.5, -0.001, 0.0, 0.001, 0.25, 0.5, 0.999, 1.0];
        for &sample in &input {
            let back = i16_to_f32(f32_to_i16(sample));
            assert!(
                (back - sample).abs() <= 1.0 / 32768.0,
                "{} came back as {}",
                sample,
                back
            );
        }
    }

    #[test]
    fn test_extremes_do_not_overflow() {
        assert_eq!(f32_to_i16(1.0), 32767);
        assert_eq!(f32_to_i16(-1.0), -32768);
        assert_eq!(f32_to_i16(3.5), 32767);
        assert_eq!(f32_to_i16(-7.0), -32768);
    }

    #[test]
    fn test_silence_is_zero() {
        let samples: Vec<i16> = [0.0f32; 64].iter().map(|&s| f32_to_i16(s)).collect();
        assert!(samples.iter().all(|&s| s == 0));
        assert!(samples_to_bytes(&samples).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bytes_little_endian() {
        assert_eq!(samples_to_bytes(&[0x0102, -2]), vec![0x02, 0x01, 0xFE, 0xFF]);
        assert!(bytes_to_f32(&[1, 2, 3]).is_none());
        assert_eq!(bytes_to_f32(&[0x00, 0x80]).unwrap(), vec![-1.0]);
    }

    #[test]
    fn test_frames_gated_by_streaming_flag() {
        let streaming = Arc::new(AtomicBool::new(false));
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut graph = CaptureGraph::new(4, Arc::clone(&streaming), events);

        // Frame 0 completes while not streaming
        graph.push(&[0.1; 4]);
        streaming.store(true, Ordering::SeqCst);
        // Frames 1 and 2 complete while streaming
        graph.push(&[0.2; 8]);
        streaming.store(false, Ordering::SeqCst);
        // Frame 3 completes after streaming stopped
        graph.push(&[0.3; 4]);

        let mut emitted = Vec::new();
        while let Ok(AudioEvent::Frame(frame)) = rx.try_recv() {
            emitted.push(frame.sequence);
        }
        assert_eq!(emitted, vec![1, 2]);
    }

    #[test]
    fn test_stale_partial_frame_discarded_on_start() {
        let streaming = Arc::new(AtomicBool::new(false));
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut graph = CaptureGraph::new(4, Arc::clone(&streaming), events);

        graph.push(&[0.9; 3]);
        streaming.store(true, Ordering::SeqCst);
        graph.push(&[0.1; 4]);

        match rx.try_recv() {
            Ok(AudioEvent::Frame(frame)) => {
                assert_eq!(frame.samples, vec![f32_to_i16(0.1); 4]);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
