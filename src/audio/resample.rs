//! Streaming sample-rate conversion for mono audio
//!
//! Device callbacks hand over buffers of whatever size the platform picks;
//! the sinc resampler wants fixed-size chunks. Input is buffered until a
//! whole chunk is available, so a short remainder waits for the next call.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::pipeline::AudioError;

/// Mono resampler accepting input of any length
pub struct StreamResampler {
    /// `None` when both rates match
    resampler: Option<SincFixedIn<f32>>,
    chunk_size: usize,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// `chunk_size` is the number of input frames converted per step
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self, AudioError> {
        if source_rate == 0 || target_rate == 0 || chunk_size == 0 {
            return Err(AudioError::Device(format!(
                "cannot resample {} Hz to {} Hz in chunks of {}",
                source_rate, target_rate, chunk_size
            )));
        }

        let resampler = if source_rate == target_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::new(
                f64::from(target_rate) / f64::from(source_rate),
                2.0,
                params,
                chunk_size,
                1,
            )
            .map_err(|e| AudioError::Device(e.to_string()))?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            chunk_size,
            pending: Vec::new(),
        })
    }

    /// Input frames consumed by the next conversion step
    pub fn input_frames_next(&self) -> usize {
        self.resampler
            .as_ref()
            .map_or(self.chunk_size, |resampler| resampler.input_frames_next())
    }

    /// Convert `samples`, returning every output frame that is ready
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let waves = resampler
                .process(&[chunk], None)
                .map_err(|e| AudioError::Stream(e.to_string()))?;
            if let Some(wave) = waves.into_iter().next() {
                out.extend(wave);
            }
        }
        Ok(out)
    }
}

/// Average interleaved frames down to one channel
pub fn downmix<T: Copy>(data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|&s| to_f32(s)).collect();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() / frame.len() as f32)
        .collect()
}
