//! PCM transport codec: normalized f32 blocks to base64-armored 16-bit
//! little-endian PCM and back.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::PipelineError;

/// A block of mono audio samples in the normalized -1.0..1.0 range.
///
/// Produced by capture or decode, never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Normalize raw 16-bit PCM from a capture device.
    pub fn from_pcm16(pcm: &[i16], sample_rate: u32) -> Self {
        Self {
            samples: pcm.iter().map(|&s| s as f32 / 32768.0).collect(),
            sample_rate,
        }
    }

    /// Duration of the block in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Base64 text armor around 16-bit LE PCM, tagged with a mime-like
/// descriptor that carries the sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub data: String,
    pub mime_type: String,
}

impl EncodedFrame {
    pub fn new(data: String, sample_rate: u32) -> Self {
        Self {
            data,
            mime_type: format!("audio/pcm;rate={}", sample_rate),
        }
    }

    /// Sample rate parsed from the `rate=` parameter of the descriptor.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("rate="))
            .find_map(|v| v.parse().ok())
    }
}

/// Quantize one normalized sample to i16.
///
/// Clamp, scale by 32767, truncate toward negative infinity: 0.5 maps to
/// 16383, -0.5 to -16384, and the extremes to +/-32767.
pub(crate) fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) as f64 * 32767.0).floor() as i16
}

/// Encode a block as base64-armored 16-bit LE PCM.
///
/// Pure function of the block; per-sample quantization error stays within
/// 1/32768. An empty block yields an empty frame.
pub fn encode(block: &AudioBlock) -> EncodedFrame {
    let mut bytes = Vec::with_capacity(block.samples.len() * 2);
    for &sample in &block.samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    EncodedFrame::new(BASE64.encode(&bytes), block.sample_rate)
}

/// Decode a frame back into a normalized block.
///
/// Bad armor and odd byte counts are `MalformedFrame`; the caller drops
/// the frame and keeps the stream alive. A frame whose descriptor carries
/// no usable rate is tagged with `fallback_rate`.
pub fn decode(frame: &EncodedFrame, fallback_rate: u32) -> Result<AudioBlock, PipelineError> {
    let bytes = BASE64
        .decode(frame.data.as_bytes())
        .map_err(|e| PipelineError::MalformedFrame(format!("bad base64 armor: {}", e)))?;
    if bytes.len() % 2 != 0 {
        return Err(PipelineError::MalformedFrame(format!(
            "odd byte length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();
    Ok(AudioBlock {
        samples,
        sample_rate: frame.sample_rate().unwrap_or(fallback_rate),
    })
}
