mod audio;
mod config;
mod error;
mod pipeline;
mod session;

use std::path::Path;
use std::time::Instant;

use tokio::signal;
use tokio::sync::mpsc;

use audio::capture::CaptureSource;
use audio::pcm_codec::AudioBlock;
use audio::playback::{AlsaSink, PlaybackScheduler, SinkEvent};
use config::Config;
use error::PipelineError;
use pipeline::VoicePipeline;
use session::{SessionCommand, SessionEvent, SessionLink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "voicelink.toml".to_string());
    let config = Config::load(Path::new(&config_path))?;

    // Channels between the audio threads, the session link, and the
    // pipeline select loop.
    let (capture_tx, mut capture_rx) = mpsc::channel::<AudioBlock>(16);
    let (session_event_tx, mut session_event_rx) = mpsc::channel::<SessionEvent>(100);
    let (session_cmd_tx, session_cmd_rx) = mpsc::channel::<SessionCommand>(100);
    let (sink_event_tx, mut sink_event_rx) = mpsc::channel::<SinkEvent>(64);

    let scheduler = PlaybackScheduler::new();
    let sink = AlsaSink::start(
        &config.playback_device,
        config.playback_sample_rate,
        scheduler.epoch_handle(),
        sink_event_tx,
    )?;

    // Device failure here is terminal for the attempt; the process exits
    // and the operator decides whether to try again.
    let mut capture = CaptureSource::start(
        &config.capture_device,
        config.capture_sample_rate,
        config.capture_block_samples,
        capture_tx,
    )?;

    let link = SessionLink::new(config.clone(), session_event_tx, session_cmd_rx);
    tokio::spawn(link.run());

    let mut pipeline = VoicePipeline::new(&config, scheduler, Box::new(sink), session_cmd_tx);

    log::info!("voicelink started");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Ctrl-C, shutting down");
                break;
            }

            Some(block) = capture_rx.recv() => {
                pipeline.handle_capture_block(block, Instant::now()).await;
            }

            Some(event) = session_event_rx.recv() => {
                match pipeline.handle_session_event(event, Instant::now()).await {
                    Ok(()) => {}
                    Err(PipelineError::Closed) => {
                        log::info!("Session closed by remote");
                        break;
                    }
                    Err(e) => {
                        log::error!("Session failed: {}", e);
                        break;
                    }
                }
            }

            Some(event) = sink_event_rx.recv() => {
                pipeline.handle_sink_event(event);
            }

            else => break,
        }
    }

    // Closing the receivers first unblocks any audio thread stuck in a
    // channel send, so the joins below cannot hang.
    capture_rx.close();
    sink_event_rx.close();
    capture.stop();
    pipeline.reset();
    Ok(())
}
