//! Fixed-ratio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Used in both directions: device rate → 16 kHz on the capture side and
//! 24 kHz → device rate on the playback side. Equal rates skip rubato entirely.
//!
//! The converter treats everything fed since the last [`RateConverter::reset`]
//! as one continuous signal. Feeding it in pieces yields the same samples as
//! feeding it whole; only [`RateConverter::finish`] pads with silence.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoiceError};

/// Converts mono f32 audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when `from_rate == to_rate`.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carried over between calls until a full block is available.
    pending: Vec<f32>,
    block_size: usize,
    output_buf: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
    /// Leading output samples still owed to the interpolator's delay.
    delay_left: usize,
    /// Input samples fed since the last reset.
    consumed: u64,
    /// Output samples handed out since the last reset.
    emitted: u64,
}

impl RateConverter {
    /// # Errors
    /// `VoiceError::Device` if rubato rejects the ratio or block size.
    pub fn new(from_rate: u32, to_rate: u32, block_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::Device(format!(
                "invalid resample rates {from_rate} -> {to_rate}"
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block_size,
                output_buf: Vec::new(),
                from_rate,
                to_rate,
                delay_left: 0,
                consumed: 0,
                emitted: 0,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            block_size,
            1,
        )
        .map_err(|e| VoiceError::Device(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        let delay_left = resampler.output_delay();

        tracing::debug!(from_rate, to_rate, block_size, delay_left, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            block_size,
            output_buf,
            from_rate,
            to_rate,
            delay_left,
            consumed: 0,
            emitted: 0,
        })
    }

    /// Feed the next piece of the signal; returns whatever full blocks
    /// produced (may be empty). The tail stays inside until more input
    /// arrives or [`finish`](Self::finish) is called.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        self.consumed += samples.len() as u64;
        self.feed(samples)
    }

    /// Emit the held-back tail of the current signal and start a new one.
    ///
    /// Over the whole signal, `process` plus `finish` return exactly
    /// `input_len * to_rate / from_rate` samples.
    pub fn finish(&mut self) -> Vec<f32> {
        if self.is_passthrough() {
            return Vec::new();
        }
        let expected = self.consumed * self.to_rate as u64 / self.from_rate as u64;
        let owed = expected.saturating_sub(self.emitted) as usize;
        let mut tail = Vec::with_capacity(owed);
        // The tail is at most one block plus the interpolator's reach.
        for _ in 0..3 {
            if tail.len() >= owed {
                break;
            }
            let pad = vec![0f32; self.block_size - self.pending.len() % self.block_size];
            tail.extend(self.feed(&pad));
        }
        tail.truncate(owed);
        self.reset();
        tail
    }

    /// Drop the current signal without emitting its tail.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.consumed = 0;
        self.emitted = 0;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
            self.delay_left = resampler.output_delay();
        }
    }

    /// `true` while input is held that `finish` would still have to emit.
    pub fn has_tail(&self) -> bool {
        !self.is_passthrough() && self.consumed > 0
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    fn feed(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.block_size {
            let block = &self.pending[..self.block_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_, produced)) => {
                    let skip = self.delay_left.min(produced);
                    self.delay_left -= skip;
                    out.extend_from_slice(&self.output_buf[0][skip..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.block_size);
        }
        self.emitted += out.len() as u64;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / rate).sin() * 0.5)
            .collect()
    }

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 1024).expect("converter");
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.finish().is_empty());
    }

    #[test]
    fn downsample_48k_to_16k_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_block_is_held_back() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(rc.has_tail());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn finish_emits_exact_length() {
        let mut rc = RateConverter::new(24_000, 48_000, 480).expect("converter");
        let mut out = rc.process(&vec![0.1f32; 1_000]);
        out.extend(rc.finish());
        assert_eq!(out.len(), 2_000);
        assert!(!rc.has_tail());

        let mut rc = RateConverter::new(24_000, 44_100, 480).expect("converter");
        let mut out = rc.process(&vec![0.1f32; 1_000]);
        out.extend(rc.finish());
        assert_eq!(out.len(), 1_837);
    }

    #[test]
    fn split_signal_matches_whole_signal() {
        let signal = sine(2_000, 24_000.0);
        for to_rate in [48_000, 44_100] {
            let mut whole = RateConverter::new(24_000, to_rate, 480).expect("converter");
            let mut expected = whole.process(&signal);
            expected.extend(whole.finish());

            let mut split = RateConverter::new(24_000, to_rate, 480).expect("converter");
            let mut actual = split.process(&signal[..1_000]);
            actual.extend(split.process(&signal[1_000..]));
            actual.extend(split.finish());

            assert_eq!(actual, expected, "to_rate={to_rate}");
        }
    }

    #[test]
    fn no_silence_at_the_seam() {
        let signal = sine(2_000, 24_000.0);
        let mut rc = RateConverter::new(24_000, 48_000, 480).expect("converter");
        let mut out = rc.process(&signal[..1_000]);
        out.extend(rc.process(&signal[1_000..]));
        out.extend(rc.finish());
        let longest_zero_run = out
            .split(|s| *s != 0.0)
            .map(<[f32]>::len)
            .max()
            .unwrap_or(0);
        assert!(longest_zero_run <= 2, "zero run of {longest_zero_run}");
    }

    #[test]
    fn reset_discards_the_tail() {
        let mut rc = RateConverter::new(24_000, 48_000, 480).expect("converter");
        rc.process(&vec![0.3f32; 700]);
        rc.reset();
        assert!(!rc.has_tail());
        assert!(rc.finish().is_empty());
    }

    #[test]
    fn rejects_zero_rate() {
        assert!(RateConverter::new(0, 16_000, 960).is_err());
    }
}
