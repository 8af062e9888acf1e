//! Audio module for microphone capture and speaker playback
//!
//! Converts between native float samples and the 16-bit PCM used on the
//! wire, gates capture by a streaming flag and schedules playback chunks
//! back to back.

#[cfg(feature = "hardware")]
mod cpal_host;
mod pcm;
mod pipeline;
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
mod resample;
mod scheduler;

#[cfg(feature = "hardware")]
pub use cpal_host::CpalHost;
pub use pcm::{f32_to_i16, i16_to_f32, samples_to_bytes, AudioFrame, CaptureGraph};
pub use pipeline::{
    AudioBackend, AudioError, AudioHost, AudioPipeline, CaptureRequest, ClockState,
};
pub use scheduler::PlaybackScheduler;
