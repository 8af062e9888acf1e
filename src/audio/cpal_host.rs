//! cpal-backed microphone and speaker
//!
//! cpal streams are not `Send`, so they live on a dedicated thread that is
//! driven through a command channel. Devices run at their own default
//! rate; capture is resampled down to the wire rate and playback up from
//! it. Playback pulls from a shared sample queue and the playback clock
//! counts the queue samples consumed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tracing::{debug, error, info};

use crate::events::AudioEvent;

use super::pcm::CaptureGraph;
use super::pipeline::{AudioBackend, AudioError, AudioHost, CaptureRequest, ClockState};
use super::resample::{downmix, StreamResampler};

enum Command {
    Resume(mpsc::Sender<Result<ClockState, AudioError>>),
    Close,
}

/// Audio host using the platform default cpal host
#[derive(Debug, Default)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

impl AudioHost for CpalHost {
    fn open(
        &self,
        request: &CaptureRequest,
        graph: CaptureGraph,
    ) -> Result<Box<dyn AudioBackend>, AudioError> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let rendered = Arc::new(AtomicU64::new(0));
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let request_owned = request.clone();
        let thread_queue = Arc::clone(&queue);
        let thread_rendered = Arc::clone(&rendered);

        thread::Builder::new()
            .name("audio-io".to_string())
            .spawn(move || {
                let streams = build_streams(&request_owned, graph, thread_queue, thread_rendered);
                let (input, output) = match streams {
                    Ok(streams) => {
                        let _ = ready_tx.send(Ok(()));
                        streams
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                debug!("audio thread started");
                while let Ok(command) = command_rx.recv() {
                    match command {
                        Command::Resume(reply) => {
                            let result = input
                                .play()
                                .and_then(|()| output.play())
                                .map(|()| ClockState::Running)
                                .map_err(|e| AudioError::Stream(e.to_string()));
                            let _ = reply.send(result);
                        }
                        Command::Close => break,
                    }
                }
                debug!("audio thread stopped");
            })
            .map_err(|e| AudioError::Device(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::Device("audio thread exited during setup".to_string()))??;

        Ok(Box::new(CpalBackend {
            commands: command_tx,
            queue,
            rendered,
            output_rate: request.output_sample_rate,
        }))
    }
}

struct CpalBackend {
    commands: mpsc::Sender<Command>,
    queue: Arc<Mutex<VecDeque<f32>>>,
    rendered: Arc<AtomicU64>,
    output_rate: u32,
}

impl AudioBackend for CpalBackend {
    fn resume(&mut self) -> Result<ClockState, AudioError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(Command::Resume(reply_tx))
            .map_err(|_| AudioError::Stream("audio thread is gone".to_string()))?;
        reply_rx
            .recv()
            .unwrap_or(Ok(ClockState::Suspended))
    }

    fn playback_clock(&self) -> f64 {
        self.rendered.load(Ordering::SeqCst) as f64 / f64::from(self.output_rate)
    }

    fn enqueue(&mut self, start: f64, samples: Vec<f32>) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        // Pad with silence if the chunk starts after the queued audio ends
        let queued_end = self.playback_clock() + queue.len() as f64 / f64::from(self.output_rate);
        let gap = ((start - queued_end) * f64::from(self.output_rate)).round();
        if gap >= 1.0 {
            queue.extend(std::iter::repeat(0.0).take(gap as usize));
        }
        queue.extend(samples);
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

fn select_input_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, AudioError> {
    if let Some(name) = name {
        let mut devices = host
            .input_devices()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        if let Some(device) = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)) {
            return Ok(device);
        }
        return Err(AudioError::Device(format!("input device '{}' not found", name)));
    }

    host.default_input_device()
        .ok_or_else(|| AudioError::Device("no input device available".to_string()))
}

/// Input frames converted per resampling step on the capture side
const CAPTURE_CHUNK: usize = 1024;
/// Source frames converted per resampling step on the playback side
const PLAYBACK_CHUNK: usize = 256;

fn build_streams(
    request: &CaptureRequest,
    graph: CaptureGraph,
    queue: Arc<Mutex<VecDeque<f32>>>,
    rendered: Arc<AtomicU64>,
) -> Result<(Stream, Stream), AudioError> {
    let host = cpal::default_host();

    let input_device = select_input_device(&host, request.device_id.as_deref())?;
    let input_supported = input_device
        .default_input_config()
        .map_err(|e| AudioError::Device(e.to_string()))?;
    let input_config: StreamConfig = input_supported.config();

    // Platform voice processing is used where the host applies it by default
    debug!(
        echo_cancellation = request.echo_cancellation,
        noise_suppression = request.noise_suppression,
        auto_gain = request.auto_gain,
        "capture processing requested"
    );

    let capture_resampler = StreamResampler::new(
        input_config.sample_rate.0,
        request.sample_rate,
        CAPTURE_CHUNK,
    )?;
    let input = match input_supported.sample_format() {
        SampleFormat::F32 => {
            build_input::<f32>(&input_device, &input_config, capture_resampler, graph)
        }
        SampleFormat::I16 => {
            build_input::<i16>(&input_device, &input_config, capture_resampler, graph)
        }
        SampleFormat::U16 => {
            build_input::<u16>(&input_device, &input_config, capture_resampler, graph)
        }
        other => Err(AudioError::Device(format!(
            "unsupported input sample format {:?}",
            other
        ))),
    }?;

    let output_device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no output device available".to_string()))?;
    let output_supported = output_device
        .default_output_config()
        .map_err(|e| AudioError::Device(e.to_string()))?;
    let output_config: StreamConfig = output_supported.config();

    let playback = Playback {
        resampler: StreamResampler::new(
            request.output_sample_rate,
            output_config.sample_rate.0,
            PLAYBACK_CHUNK,
        )?,
        queue,
        rendered,
        ready: VecDeque::new(),
    };
    let output = match output_supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&output_device, &output_config, playback),
        SampleFormat::I16 => build_output::<i16>(&output_device, &output_config, playback),
        SampleFormat::U16 => build_output::<u16>(&output_device, &output_config, playback),
        other => Err(AudioError::Device(format!(
            "unsupported output sample format {:?}",
            other
        ))),
    }?;

    info!(
        input = %input_device.name().unwrap_or_default(),
        input_rate = input_config.sample_rate.0,
        input_channels = input_config.channels,
        capture_rate = request.sample_rate,
        output = %output_device.name().unwrap_or_default(),
        output_rate = output_config.sample_rate.0,
        output_channels = output_config.channels,
        playback_rate = request.output_sample_rate,
        "audio streams built"
    );

    Ok((input, output))
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut resampler: StreamResampler,
    mut graph: CaptureGraph,
) -> Result<Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    let events = graph.events();
    let error_events = graph.events();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels, |s| s.to_sample::<f32>());
                match resampler.process(&mono) {
                    Ok(samples) if !samples.is_empty() => graph.push(&samples),
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "capture resampling failed");
                        events.publish(AudioEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            },
            move |err| {
                error!(error = %err, "audio capture error");
                error_events.publish(AudioEvent::Error {
                    message: err.to_string(),
                });
            },
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}

/// Playback side of the output callback
///
/// The queue holds samples at the conversation's output rate; the clock
/// counts those samples as they are pulled, so it keeps running on silence.
struct Playback {
    resampler: StreamResampler,
    queue: Arc<Mutex<VecDeque<f32>>>,
    rendered: Arc<AtomicU64>,
    /// Converted samples at the device rate not yet written out
    ready: VecDeque<f32>,
}

impl Playback {
    fn fill(&mut self, frames: usize) {
        while self.ready.len() < frames {
            let wanted = self.resampler.input_frames_next();
            let chunk: Vec<f32> = {
                let mut queue = match self.queue.lock() {
                    Ok(queue) => queue,
                    Err(poisoned) => poisoned.into_inner(),
                };
                self.rendered.fetch_add(wanted as u64, Ordering::SeqCst);
                (0..wanted).map(|_| queue.pop_front().unwrap_or(0.0)).collect()
            };

            match self.resampler.process(&chunk) {
                Ok(samples) if !samples.is_empty() => self.ready.extend(samples),
                Ok(_) => break,
                Err(e) => {
                    error!(error = %e, "playback resampling failed");
                    break;
                }
            }
        }
    }
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    mut playback: Playback,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                playback.fill(data.len() / channels.max(1));
                for frame in data.chunks_mut(channels.max(1)) {
                    let sample = playback.ready.pop_front().unwrap_or(0.0);
                    frame.iter_mut().for_each(|out| *out = T::from_sample(sample));
                }
            },
            |err| {
                error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}
