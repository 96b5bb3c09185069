//! Playback scheduling on a virtual clock, plus the ALSA render sink.
//!
//! The scheduler is pure bookkeeping: it binds each decoded block to the
//! next free slot on a monotonically advancing clock. Rendering happens
//! on a dedicated OS thread behind the `AudioSink` seam, which also
//! keeps tests free of real hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;

use super::alsa_device;
use super::pcm_codec::{AudioBlock, quantize};
use crate::error::PipelineError;

/// A decoded block bound to its slot on the virtual playback clock.
#[derive(Debug, Clone)]
pub struct PlaybackSegment {
    pub block: AudioBlock,
    /// Scheduled start, seconds on the virtual clock.
    pub start: f64,
    /// Seconds of audio in the block.
    pub duration: f64,
    /// Interruption epoch the segment belongs to. The sink drops
    /// segments from an older epoch, so audio rendered after a barge-in
    /// is strictly audio scheduled after it.
    pub epoch: u64,
}

/// Events reported back by the sink as it renders.
#[derive(Debug, Clone, Copy)]
pub enum SinkEvent {
    /// A segment finished rendering; `end` is the sink clock at that
    /// point in seconds.
    SegmentDone { end: f64 },
}

/// Rendering endpoint for scheduled segments.
pub trait AudioSink: Send {
    /// Seconds of audio rendered so far (the sink's own clock).
    fn now(&self) -> f64;

    /// Hand a segment over for rendering at `segment.start`. Must not
    /// block and must accept every segment the scheduler produced — the
    /// clock has already advanced past it, so dropping one would leave a
    /// hole in the timeline. Rendering happens elsewhere.
    fn submit(&self, segment: PlaybackSegment) -> Result<()>;

    /// Release the sink resource. Idempotent.
    fn shutdown(&mut self);
}

/// Tracks the "next free slot" on the playback timeline.
pub struct PlaybackScheduler {
    clock: f64,
    epoch: Arc<AtomicU64>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            clock: 0.0,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared epoch counter, handed to the sink at construction.
    pub fn epoch_handle(&self) -> Arc<AtomicU64> {
        self.epoch.clone()
    }

    /// Current "next free slot" in seconds.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// Bind `block` to the next free slot and advance the clock past it.
    ///
    /// `now` is the sink clock. A block arriving after the previous one
    /// finished starts immediately, leaving a silence gap; otherwise it
    /// starts back-to-back. Segments never overlap.
    pub fn schedule_next(&mut self, block: AudioBlock, now: f64) -> PlaybackSegment {
        let start = now.max(self.clock);
        let duration = block.duration();
        self.clock = start + duration;
        PlaybackSegment {
            block,
            start,
            duration,
            epoch: self.epoch.load(Ordering::Acquire),
        }
    }

    /// Barge-in: zero the clock and invalidate everything scheduled so
    /// far, so the sink discards whatever it has not rendered yet.
    pub fn interrupt(&mut self) {
        self.clock = 0.0;
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// True when `sink_now` has caught up with the scheduled horizon to
    /// within `epsilon` seconds, i.e. nothing further is pending.
    pub fn drained(&self, sink_now: f64, epsilon: f64) -> bool {
        self.clock - sink_now <= epsilon
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// ALSA-backed sink. The render thread fills scheduling gaps with
/// silence and counts every frame written, silence included, as its
/// clock.
///
/// The queue is unbounded: the agent streams audio faster than real
/// time, so a long turn piles up far ahead of the render position.
/// Every segment the scheduler accounted for must eventually render
/// (or be flushed wholesale by a barge-in via the epoch); rejecting one
/// would leave a hole in the timeline the clock already advanced past.
pub struct AlsaSink {
    tx: Option<mpsc::UnboundedSender<PlaybackSegment>>,
    position_us: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaSink {
    /// Open the playback device and start the render thread.
    ///
    /// As with capture, the device opens on the render thread but the
    /// result comes back before this returns, so a missing device fails
    /// the start instead of dying silently later.
    pub fn start(
        device: &str,
        sample_rate: u32,
        epoch: Arc<AtomicU64>,
        events: mpsc::Sender<SinkEvent>,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::unbounded_channel::<PlaybackSegment>();
        let position_us = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let handle = {
            let device = device.to_string();
            let position_us = position_us.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-render".into())
                .spawn(move || {
                    render_thread(&device, sample_rate, rx, epoch, events, position_us, &running, ready_tx)
                })
                .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx: Some(tx),
                position_us,
                running,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(PipelineError::DeviceUnavailable(format!("{:#}", e)))
            }
            Err(_) => {
                let _ = handle.join();
                Err(PipelineError::DeviceUnavailable(
                    "render thread exited before opening the device".into(),
                ))
            }
        }
    }
}

impl AudioSink for AlsaSink {
    fn now(&self) -> f64 {
        self.position_us.load(Ordering::Acquire) as f64 / 1_000_000.0
    }

    fn submit(&self, segment: PlaybackSegment) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow!("sink is shut down"))?;
        tx.send(segment)
            .map_err(|_| anyhow!("render thread is gone"))
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the sender wakes the render thread out of its
        // blocking receive.
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Frames written per chunk between epoch checks, so a barge-in cuts
/// into a segment mid-render instead of waiting for it to finish.
const RENDER_CHUNK_FRAMES: usize = 1024;

/// Render one segment through `write`: silence chunks up to its slot,
/// then the quantized block data, re-checking the interruption epoch
/// between chunks. Returns the new position in frames, or `None` when a
/// barge-in cancelled the segment before any of its audio went out.
fn render_segment(
    segment: &PlaybackSegment,
    start_position: u64,
    rate: f64,
    epoch: &AtomicU64,
    write: &mut impl FnMut(&[i16]) -> u64,
) -> Option<u64> {
    let current_epoch = segment.epoch;
    let mut position = start_position;

    // Fill any scheduling gap with silence so the segment lands at its
    // slot instead of playing early. Chunked like the data, so a
    // barge-in landing mid-gap takes effect without waiting out the
    // fill.
    let start_frame = (segment.start * rate).round() as u64;
    if start_frame > position {
        let silence = vec![0i16; RENDER_CHUNK_FRAMES];
        let mut gap = (start_frame - position) as usize;
        while gap > 0 {
            if epoch.load(Ordering::Acquire) > current_epoch {
                return None;
            }
            let n = gap.min(RENDER_CHUNK_FRAMES);
            position += write(&silence[..n]);
            gap -= n;
        }
    }

    let pcm_data: Vec<i16> = segment.block.samples.iter().map(|&s| quantize(s)).collect();
    for chunk in pcm_data.chunks(RENDER_CHUNK_FRAMES) {
        if epoch.load(Ordering::Acquire) > current_epoch {
            // Barge-in mid-segment: drop the rest.
            break;
        }
        position += write(chunk);
    }

    Some(position)
}

#[allow(clippy::too_many_arguments)]
fn render_thread(
    device: &str,
    sample_rate: u32,
    mut rx: mpsc::UnboundedReceiver<PlaybackSegment>,
    epoch: Arc<AtomicU64>,
    events: mpsc::Sender<SinkEvent>,
    position_us: Arc<AtomicU64>,
    running: &AtomicBool,
    ready_tx: std::sync::mpsc::Sender<anyhow::Result<()>>,
) {
    let (pcm, params) = match alsa_device::open_playback(device, sample_rate) {
        Ok(v) => {
            let _ = ready_tx.send(Ok(()));
            v
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            log::error!("Failed to get playback I/O handle: {}", e);
            return;
        }
    };

    let rate = params.sample_rate as f64;
    // Sink clock in frames actually written, silence included.
    let mut position: u64 = 0;

    log::info!("Render started: rate={}", params.sample_rate);

    while running.load(Ordering::Relaxed) {
        let Some(segment) = rx.blocking_recv() else {
            log::info!("Render queue closed");
            break;
        };

        if segment.epoch < epoch.load(Ordering::Acquire) {
            // Scheduled before a barge-in; never render it.
            continue;
        }

        let mut pos = position;
        let mut write = |data: &[i16]| {
            let n = write_frames(&pcm, &io, data);
            pos += n;
            position_us.store(frames_to_us(pos, rate), Ordering::Release);
            n
        };
        match render_segment(&segment, position, rate, &epoch, &mut write) {
            Some(end_position) => position = end_position,
            // Cancelled before any audio went out; no progress report.
            None => continue,
        }

        let done = SinkEvent::SegmentDone {
            end: position as f64 / rate,
        };
        if events.blocking_send(done).is_err() {
            log::info!("Sink event receiver dropped");
            break;
        }
    }

    log::info!("Render stopped");
}

fn frames_to_us(frames: u64, rate: f64) -> u64 {
    (frames as f64 / rate * 1_000_000.0) as u64
}

/// Write one buffer to ALSA, recovering from XRUN with a bounded retry
/// loop. Returns the number of frames accounted for (frames the device
/// never took after repeated failures are counted too, so the sink clock
/// keeps advancing monotonically).
fn write_frames(pcm: &alsa::pcm::PCM, io: &alsa::pcm::IO<i16>, data: &[i16]) -> u64 {
    let total = data.len();
    let mut written = 0usize;
    let mut retries = 0u32;

    while written < total {
        match io.writei(&data[written..]) {
            Ok(n) => {
                written += n;
                retries = 0;
            }
            Err(e) => {
                log::warn!("ALSA playback error: {}, recovering...", e);
                retries += 1;
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM playback: {}", e2);
                    break;
                }
                if retries >= 3 {
                    log::error!(
                        "Dropping {} unwritten frames after repeated recovery",
                        total - written
                    );
                    break;
                }
            }
        }
    }

    total as u64
}
