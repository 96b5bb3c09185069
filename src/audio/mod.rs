//! Audio capture, playback scheduling, speech activity detection, and
//! the PCM transport codec.
//!
//! Real-time I/O runs on dedicated std::threads (ALSA capture and
//! render); everything else is plain bookkeeping driven by the pipeline
//! select loop.

pub mod activity;
mod alsa_device;
pub mod capture;
pub mod pcm_codec;
pub mod playback;
