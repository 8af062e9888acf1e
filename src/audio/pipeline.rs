//! Audio pipeline: microphone capture, streaming gate and scheduled playback

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::AudioSettings;
use crate::events::{AudioEvent, EventBus};

use super::pcm::{bytes_to_f32, CaptureGraph};
use super::scheduler::{chunk_duration, PlaybackScheduler};

/// Errors raised by the audio pipeline and its backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("audio pipeline is not initialized")]
    NotInitialized,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("PCM buffer has odd length {0}")]
    InvalidPcm(usize),
}

/// State of the playback/capture clock after a resume attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Running,
    Suspended,
}

/// Microphone processing requested from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Input device name; `None` selects the default microphone
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub output_sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

/// Opened microphone and speaker
pub trait AudioBackend: Send {
    /// Bring capture and playback to a running state
    fn resume(&mut self) -> Result<ClockState, AudioError>;

    /// Current playback clock in seconds
    fn playback_clock(&self) -> f64;

    /// Queue samples to start playing at `start` on the playback clock
    fn enqueue(&mut self, start: f64, samples: Vec<f32>);

    /// Release the devices
    fn close(&mut self);
}

/// Factory for audio backends
pub trait AudioHost: Send + Sync {
    /// Open the microphone and speaker, feeding captured samples to `graph`
    fn open(
        &self,
        request: &CaptureRequest,
        graph: CaptureGraph,
    ) -> Result<Box<dyn AudioBackend>, AudioError>;
}

/// Capture and playback for one conversation
pub struct AudioPipeline {
    host: Arc<dyn AudioHost>,
    settings: AudioSettings,
    streaming: Arc<AtomicBool>,
    backend: Option<Box<dyn AudioBackend>>,
    scheduler: PlaybackScheduler,
    events: EventBus<AudioEvent>,
}

impl AudioPipeline {
    pub fn new(host: Arc<dyn AudioHost>, settings: AudioSettings) -> Self {
        Self {
            host,
            settings,
            streaming: Arc::new(AtomicBool::new(false)),
            backend: None,
            scheduler: PlaybackScheduler::new(),
            events: EventBus::default(),
        }
    }

    /// Subscribe to audio notifications, including captured frames
    pub fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.events.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Acquire the microphone and build the capture graph
    ///
    /// `input_device` overrides the configured device; reinitializing
    /// releases the previous devices first.
    pub fn initialize(&mut self, input_device: Option<&str>) -> Result<(), AudioError> {
        self.stop();

        let request = CaptureRequest {
            device_id: input_device
                .map(str::to_owned)
                .or_else(|| self.settings.input_device.clone()),
            sample_rate: self.settings.input_sample_rate,
            output_sample_rate: self.settings.output_sample_rate,
            echo_cancellation: self.settings.echo_cancellation,
            noise_suppression: self.settings.noise_suppression,
            auto_gain: self.settings.auto_gain,
        };

        let graph = CaptureGraph::new(
            self.settings.frame_samples,
            Arc::clone(&self.streaming),
            self.events.clone(),
        );

        let backend = self.host.open(&request, graph)?;
        self.backend = Some(backend);
        self.scheduler.reset();

        info!(
            device = request.device_id.as_deref().unwrap_or("default"),
            input_rate = request.sample_rate,
            output_rate = request.output_sample_rate,
            frame_samples = self.settings.frame_samples,
            "audio pipeline initialized"
        );
        Ok(())
    }

    /// Start forwarding captured frames
    pub fn start_streaming(&mut self) {
        self.streaming.store(true, Ordering::SeqCst);
        self.events.publish(AudioEvent::StreamingStarted);
        debug!("streaming started");

        let Some(backend) = self.backend.as_mut() else {
            self.warn("audio pipeline not initialized, nothing will be captured");
            return;
        };

        match backend.resume() {
            Ok(ClockState::Running) => {}
            Ok(ClockState::Suspended) => {
                self.warn("audio clock is still suspended; user action may be required");
            }
            Err(e) => self.warn(&format!("failed to resume audio: {}", e)),
        }
    }

    /// Stop forwarding captured frames; frames already sent are unaffected
    pub fn stop_streaming(&mut self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            self.events.publish(AudioEvent::StreamingStopped);
            debug!("streaming stopped");
        }
    }

    /// Schedule a PCM chunk from the conversation service for playback
    ///
    /// Returns the start time on the playback clock.
    pub fn play_audio(&mut self, pcm: &[u8]) -> Result<f64, AudioError> {
        let backend = self.backend.as_mut().ok_or(AudioError::NotInitialized)?;
        let samples = bytes_to_f32(pcm).ok_or(AudioError::InvalidPcm(pcm.len()))?;
        if samples.is_empty() {
            return Ok(self.scheduler.cursor());
        }

        let duration = chunk_duration(samples.len(), self.settings.output_sample_rate);
        let now = backend.playback_clock();
        let start = self.scheduler.schedule(now, duration);
        backend.enqueue(start, samples);

        debug!(start, duration, now, "playback chunk scheduled");
        Ok(start)
    }

    /// Release the microphone and close audio; safe to call repeatedly
    pub fn stop(&mut self) {
        self.stop_streaming();
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            self.scheduler.reset();
            info!("audio pipeline stopped");
        }
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
        self.events.publish(AudioEvent::Warning {
            message: message.to_string(),
        });
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
