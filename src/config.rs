//! Runtime configuration, loaded from a TOML file with full defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket endpoint of the agent session.
    pub ws_url: String,
    /// Bearer token sent on connect; empty disables the header.
    pub ws_token: String,

    /// ALSA capture device name (e.g. "default", "plughw:0,0").
    pub capture_device: String,
    /// ALSA playback device name.
    pub playback_device: String,
    /// Capture rate; the transport expects 16 kHz.
    pub capture_sample_rate: u32,
    /// Playback rate; agent audio arrives at 24 kHz.
    pub playback_sample_rate: u32,
    /// Samples per capture block (~256 ms at 16 kHz).
    pub capture_block_samples: usize,

    /// Activity detection RMS threshold.
    pub vad_threshold: f32,
    /// Hangover before a talking direction falls back to idle, ms.
    pub vad_hangover_ms: u64,
    /// Tolerance of the end-of-utterance fallback heuristic, ms.
    pub utterance_end_epsilon_ms: u64,

    /// Session-level setup, serialized verbatim at connect time and
    /// never interpreted by the pipeline.
    pub session: SessionSetup,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "wss://localhost:8765/session".to_string(),
            ws_token: String::new(),
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            capture_block_samples: 4096,
            vad_threshold: 0.01,
            vad_hangover_ms: 500,
            utterance_end_epsilon_ms: 100,
            session: SessionSetup::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Opaque session setup. The fields exist only so operators can set them
/// in the config file; the pipeline passes them through untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSetup {
    pub response_modality: String,
    pub voice: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub system_instruction: String,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            response_modality: "AUDIO".to_string(),
            voice: "Puck".to_string(),
            input_transcription: true,
            output_transcription: true,
            system_instruction: String::new(),
        }
    }
}
