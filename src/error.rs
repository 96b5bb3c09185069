//! Error kinds for the audio pipeline, one per recovery policy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Microphone permission denied or no usable device. Terminal for the
    /// attempt; the caller decides whether to try again.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// An inbound frame failed to decode. The frame is dropped and the
    /// session continues.
    #[error("malformed audio frame: {0}")]
    MalformedFrame(String),

    /// The session bridge reported a transport failure. Audio stops and
    /// the session is marked disconnected; no automatic reconnect.
    #[error("session transport error: {0}")]
    Transport(String),

    /// The remote side closed the session.
    #[error("session closed by remote")]
    Closed,
}
