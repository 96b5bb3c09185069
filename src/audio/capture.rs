//! Microphone capture: fixed-size normalized blocks from a dedicated
//! OS thread.
//!
//! Real-time I/O stays on a std::thread (not a tokio task) so device
//! reads never contend with async network work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use super::alsa_device;
use super::pcm_codec::AudioBlock;
use crate::error::PipelineError;

/// Handle over the capture thread.
///
/// `start` acquires the device; the thread then produces an effectively
/// infinite, non-restartable sequence of fixed-size blocks until
/// `stop()` is called.
pub struct CaptureSource {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureSource {
    /// Open the capture device and start producing blocks into `tx`.
    ///
    /// The device is opened on the capture thread, but the open result is
    /// reported back before this returns: a denied or missing device is
    /// `DeviceUnavailable`, terminal for the attempt and never retried
    /// here.
    pub fn start(
        device: &str,
        sample_rate: u32,
        block_samples: usize,
        tx: mpsc::Sender<AudioBlock>,
    ) -> Result<Self, PipelineError> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let handle = {
            let device = device.to_string();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    capture_thread(&device, sample_rate, block_samples, tx, &running, ready_tx)
                })
                .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
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
                    "capture thread exited before opening the device".into(),
                ))
            }
        }
    }

    /// Signal the thread to stop and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    device: &str,
    sample_rate: u32,
    block_samples: usize,
    tx: mpsc::Sender<AudioBlock>,
    running: &AtomicBool,
    ready_tx: std::sync::mpsc::Sender<anyhow::Result<()>>,
) {
    let (pcm, params) = match alsa_device::open_capture(device, sample_rate) {
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
            log::error!("Failed to get capture I/O handle: {}", e);
            return;
        }
    };

    let mut read_buf = vec![0i16; params.period_size];
    let mut accum: Vec<i16> = Vec::with_capacity(block_samples * 2);

    log::info!(
        "Capture started: rate={}, period={}, block={}",
        params.sample_rate,
        params.period_size,
        block_samples,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                accum.extend_from_slice(&read_buf[..frames]);
                while accum.len() >= block_samples {
                    let block = AudioBlock::from_pcm16(&accum[..block_samples], params.sample_rate);
                    if tx.blocking_send(block).is_err() {
                        log::warn!("Capture receiver dropped, stopping");
                        return;
                    }
                    accum.drain(..block_samples);
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Capture stopped");
}
