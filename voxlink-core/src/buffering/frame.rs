//! Typed PCM16 frame passed between the codec, transport and playback stages.

/// A fixed-length block of mono PCM16 samples at a known sample rate.
///
/// Produced once per capture tick or per inbound audio chunk and consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Sample rate in Hz (16000 for capture, 24000 for playback).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds. Zero for a zero-rate frame.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Samples scaled back to f32 in [-1.0, 1.0].
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().copied().map(crate::codec::dequantize).collect()
    }
}
