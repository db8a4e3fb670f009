//! PCM16 frame codec.
//!
//! ```text
//! f32 [-1, 1] ──quantize──► i16 ──LE bytes──► base64 ──► EncodedChunk { data, mimeType }
//! ```
//!
//! Quantization is the only lossy step: `decode(encode(x))` is within half a
//! step of `x`, and re-encoding a decoded frame reproduces the same bytes.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{
    buffering::frame::AudioFrame,
    error::{Result, VoiceError},
};

/// Bytes per PCM16 sample.
pub const SAMPLE_WIDTH: usize = 2;

const PCM_MIME: &str = "audio/pcm";
const FULL_SCALE: f32 = 32767.0;

/// Transport-safe PCM16 payload plus its format tag.
///
/// Serializes as `{ "mimeType": "...", "data": "..." }`, the blob shape the
/// realtime wire protocol uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    pub mime_type: String,
    pub data: String,
}

impl EncodedChunk {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Sample rate declared by the MIME tag, if any.
    pub fn sample_rate(&self) -> Option<u32> {
        rate_from_mime(&self.mime_type)
    }
}

/// `audio/pcm;rate=<hz>`
pub fn mime_for_rate(sample_rate: u32) -> String {
    format!("{PCM_MIME};rate={sample_rate}")
}

/// Extract `rate=<hz>` from a PCM MIME tag. Parameter order and case are ignored.
pub fn rate_from_mime(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next()?;
    if !essence.eq_ignore_ascii_case(PCM_MIME) {
        return None;
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// `round(s * 32767)` clamped to the i16 range. NaN maps to silence.
pub fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * FULL_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Inverse of [`quantize`], clamped to [-1.0, 1.0].
pub fn dequantize(sample: i16) -> f32 {
    (sample as f32 / FULL_SCALE).max(-1.0)
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// # Errors
/// `VoiceError::Codec` when the byte count is not a multiple of the sample width.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(VoiceError::Codec(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Quantize float samples into a frame without encoding them.
pub fn quantize_frame(samples: &[f32], sample_rate: u32) -> AudioFrame {
    AudioFrame::new(samples.iter().copied().map(quantize).collect(), sample_rate)
}

/// Encode float samples captured at `sample_rate`.
pub fn encode(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    encode_frame(&quantize_frame(samples, sample_rate))
}

/// Encode an already-quantized frame. Byte-exact inverse of [`decode`].
pub fn encode_frame(frame: &AudioFrame) -> EncodedChunk {
    EncodedChunk::new(
        BASE64_STANDARD.encode(pcm16_to_bytes(frame.samples())),
        mime_for_rate(frame.sample_rate()),
    )
}

/// Decode a chunk whose MIME tag declares its rate.
///
/// # Errors
/// `VoiceError::Codec` on an untagged rate, invalid base64 or odd byte count.
pub fn decode(chunk: &EncodedChunk) -> Result<AudioFrame> {
    let rate = chunk.sample_rate().ok_or_else(|| {
        VoiceError::Codec(format!("missing sample rate in '{}'", chunk.mime_type))
    })?;
    decode_at(chunk, rate)
}

/// Decode a chunk, falling back to `default_rate` when the tag has no rate.
pub fn decode_or(chunk: &EncodedChunk, default_rate: u32) -> Result<AudioFrame> {
    decode_at(chunk, chunk.sample_rate().unwrap_or(default_rate))
}

fn decode_at(chunk: &EncodedChunk, sample_rate: u32) -> Result<AudioFrame> {
    let bytes = BASE64_STANDARD
        .decode(chunk.data.as_bytes())
        .map_err(|e| VoiceError::Codec(format!("invalid base64 audio: {e}")))?;
    Ok(AudioFrame::new(bytes_to_pcm16(&bytes)?, sample_rate))
}
