//! Threshold-based speech activity detection with hangover hysteresis.

use std::time::{Duration, Instant};

use super::pcm_codec::AudioBlock;

pub const DEFAULT_THRESHOLD: f32 = 0.01;
pub const DEFAULT_HANGOVER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Idle,
    Talking,
}

/// One detector instance per audio direction (input and output).
///
/// A block whose RMS exceeds the threshold flips the state to `Talking`
/// and pushes the hangover deadline out; the state falls back to `Idle`
/// only once the deadline elapses with no further crossing, so brief
/// silences inside an utterance do not flap the state.
pub struct SpeechActivityDetector {
    threshold: f32,
    hangover: Duration,
    state: ActivityState,
    deadline: Option<Instant>,
}

impl SpeechActivityDetector {
    pub fn new(threshold: f32, hangover: Duration) -> Self {
        Self {
            threshold,
            hangover,
            state: ActivityState::Idle,
            deadline: None,
        }
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn is_talking(&self) -> bool {
        self.state == ActivityState::Talking
    }

    /// Classify one block. Returns the new state and the block's RMS for
    /// volume metering.
    pub fn observe(&mut self, block: &AudioBlock, now: Instant) -> (ActivityState, f32) {
        let rms = rms(&block.samples);
        if rms > self.threshold {
            self.state = ActivityState::Talking;
            self.deadline = Some(now + self.hangover);
        } else if self.state == ActivityState::Talking {
            if let Some(deadline) = self.deadline {
                if now >= deadline {
                    self.state = ActivityState::Idle;
                    self.deadline = None;
                }
            }
        }
        (self.state, rms)
    }

    /// Unconditional transition to `Idle`, clearing any pending hangover.
    /// Used by interruption, end of utterance, and teardown.
    pub fn force_idle(&mut self) {
        self.state = ActivityState::Idle;
        self.deadline = None;
    }
}

impl Default for SpeechActivityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_HANGOVER)
    }
}

/// Root-mean-square amplitude; 0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
