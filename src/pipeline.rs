//! The pipeline controller.
//!
//! Owns every piece of shared mutable state — both activity detectors,
//! the playback scheduler, and the displayed volume — as plain fields,
//! so there is a single writer at any instant. The select loop in
//! `main.rs` drives it with capture blocks, session events, and sink
//! events.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::audio::activity::{ActivityState, SpeechActivityDetector};
use crate::audio::pcm_codec::{self, AudioBlock};
use crate::audio::playback::{AudioSink, PlaybackScheduler, SinkEvent};
use crate::config::Config;
use crate::error::PipelineError;
use crate::session::{SessionCommand, SessionEvent};

pub struct VoicePipeline {
    input_activity: SpeechActivityDetector,
    output_activity: SpeechActivityDetector,
    scheduler: PlaybackScheduler,
    sink: Box<dyn AudioSink>,
    session_tx: mpsc::Sender<SessionCommand>,
    /// RMS of the most recent block from whichever direction currently
    /// has display priority (output wins while the agent talks).
    volume: f32,
    playback_rate: u32,
    end_epsilon: f64,
    connected: bool,
}

impl VoicePipeline {
    pub fn new(
        config: &Config,
        scheduler: PlaybackScheduler,
        sink: Box<dyn AudioSink>,
        session_tx: mpsc::Sender<SessionCommand>,
    ) -> Self {
        let hangover = Duration::from_millis(config.vad_hangover_ms);
        Self {
            input_activity: SpeechActivityDetector::new(config.vad_threshold, hangover),
            output_activity: SpeechActivityDetector::new(config.vad_threshold, hangover),
            scheduler,
            sink,
            session_tx,
            volume: 0.0,
            playback_rate: config.playback_sample_rate,
            end_epsilon: config.utterance_end_epsilon_ms as f64 / 1000.0,
            connected: false,
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn input_state(&self) -> ActivityState {
        self.input_activity.state()
    }

    pub fn output_state(&self) -> ActivityState {
        self.output_activity.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// One microphone block: classify, meter, encode, send.
    pub async fn handle_capture_block(&mut self, block: AudioBlock, now: Instant) {
        let (_, rms) = self.input_activity.observe(&block, now);
        if !self.output_activity.is_talking() {
            self.volume = rms;
        }

        let frame = pcm_codec::encode(&block);
        if let Err(e) = self
            .session_tx
            .send(SessionCommand::SendFrame(frame))
            .await
        {
            log::warn!("Session command channel closed: {}", e);
        }
    }

    /// One inbound session event. `Closed` and `Error` come back as
    /// errors so the caller can stop audio and mark the session
    /// disconnected; everything else is absorbed here.
    pub async fn handle_session_event(
        &mut self,
        event: SessionEvent,
        now: Instant,
    ) -> Result<(), PipelineError> {
        match event {
            SessionEvent::Opened => {
                log::info!("Session opened");
                self.connected = true;
                Ok(())
            }
            SessionEvent::Frame { audio, interrupted } => {
                if interrupted {
                    self.interrupt();
                }
                if let Some(frame) = audio {
                    self.schedule_frame(frame, now);
                }
                Ok(())
            }
            SessionEvent::TurnComplete => {
                self.finish_utterance();
                Ok(())
            }
            SessionEvent::InputTranscript(text) => {
                log::info!("transcript (user): {}", text);
                Ok(())
            }
            SessionEvent::OutputTranscript(text) => {
                log::info!("transcript (agent): {}", text);
                Ok(())
            }
            SessionEvent::Closed => {
                self.connected = false;
                Err(PipelineError::Closed)
            }
            SessionEvent::Error(message) => {
                self.connected = false;
                Err(PipelineError::Transport(message))
            }
        }
    }

    fn schedule_frame(&mut self, frame: pcm_codec::EncodedFrame, now: Instant) {
        let block = match pcm_codec::decode(&frame, self.playback_rate) {
            Ok(block) => block,
            Err(e) => {
                // Policy: a bad frame is dropped, the stream continues.
                log::warn!("Dropping frame: {}", e);
                return;
            }
        };
        if block.is_empty() {
            return;
        }

        let (_, rms) = self.output_activity.observe(&block, now);
        if self.output_activity.is_talking() {
            self.volume = rms;
        }

        let segment = self.scheduler.schedule_next(block, self.sink.now());
        if let Err(e) = self.sink.submit(segment) {
            log::warn!("Sink rejected segment: {}", e);
        }
    }

    /// Sink progress report. When the sink has caught up with the
    /// scheduled horizon and the remote never sent an explicit turn end,
    /// the timing heuristic closes the utterance.
    pub fn handle_sink_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::SegmentDone { end } => {
                if self.output_activity.is_talking() && self.scheduler.drained(end, self.end_epsilon)
                {
                    self.finish_utterance();
                }
            }
        }
    }

    /// Barge-in: flush everything scheduled and silence the output
    /// direction. Audio rendered afterwards belongs strictly after this
    /// point.
    pub fn interrupt(&mut self) {
        log::info!("Barge-in: flushing scheduled playback");
        self.scheduler.interrupt();
        self.finish_utterance();
    }

    fn finish_utterance(&mut self) {
        self.output_activity.force_idle();
        self.volume = 0.0;
    }

    /// Full teardown: equivalent to a fresh instance — clock at zero,
    /// both directions idle, volume zero, sink released.
    pub fn reset(&mut self) {
        self.scheduler.interrupt();
        self.input_activity.force_idle();
        self.output_activity.force_idle();
        self.volume = 0.0;
        self.connected = false;
        self.sink.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::PlaybackSegment;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};

    /// Sink double: records submissions, clock pinned by the test.
    struct MockSink {
        now: f64,
        submitted: Arc<Mutex<Vec<PlaybackSegment>>>,
    }

    impl AudioSink for MockSink {
        fn now(&self) -> f64 {
            self.now
        }
        fn submit(&self, segment: PlaybackSegment) -> Result<()> {
            self.submitted.lock().unwrap().push(segment);
            Ok(())
        }
        fn shutdown(&mut self) {}
    }

    struct Harness {
        pipeline: VoicePipeline,
        submitted: Arc<Mutex<Vec<PlaybackSegment>>>,
        cmd_rx: mpsc::Receiver<SessionCommand>,
    }

    fn harness(sink_now: f64) -> Harness {
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let sink = MockSink {
            now: sink_now,
            submitted: submitted.clone(),
        };
        let (tx, cmd_rx) = mpsc::channel(32);
        let pipeline = VoicePipeline::new(
            &Config::default(),
            PlaybackScheduler::new(),
            Box::new(sink),
            tx,
        );
        Harness {
            pipeline,
            submitted,
            cmd_rx,
        }
    }

    fn agent_frame(amplitude: f32, samples: usize) -> SessionEvent {
        let block = AudioBlock::new(vec![amplitude; samples], 24000);
        SessionEvent::Frame {
            audio: Some(pcm_codec::encode(&block)),
            interrupted: false,
        }
    }

    #[tokio::test]
    async fn capture_blocks_are_encoded_and_sent() {
        let mut h = harness(0.0);
        let block = AudioBlock::new(vec![0.25; 4096], 16000);
        h.pipeline.handle_capture_block(block, Instant::now()).await;

        match h.cmd_rx.try_recv().unwrap() {
            SessionCommand::SendFrame(frame) => {
                assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
                assert!(!frame.data.is_empty());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!((h.pipeline.volume() - 0.25).abs() < 1e-3);
        assert_eq!(h.pipeline.input_state(), ActivityState::Talking);
    }

    #[tokio::test]
    async fn output_direction_preempts_input_metering() {
        let mut h = harness(0.0);
        let now = Instant::now();

        h.pipeline
            .handle_session_event(agent_frame(0.5, 2400), now)
            .await
            .unwrap();
        assert_eq!(h.pipeline.output_state(), ActivityState::Talking);
        let agent_volume = h.pipeline.volume();
        assert!((agent_volume - 0.5).abs() < 1e-3);

        // A loud capture block must not displace the agent's volume.
        let block = AudioBlock::new(vec![0.9; 4096], 16000);
        h.pipeline.handle_capture_block(block, now).await;
        assert_eq!(h.pipeline.volume(), agent_volume);
    }

    #[tokio::test]
    async fn frames_schedule_in_order_without_overlap() {
        let mut h = harness(0.0);
        let now = Instant::now();
        for _ in 0..3 {
            h.pipeline
                .handle_session_event(agent_frame(0.3, 24000), now)
                .await
                .unwrap();
        }

        let segments = h.submitted.lock().unwrap();
        assert_eq!(segments.len(), 3);
        for pair in segments.windows(2) {
            assert!(pair[1].start + 1e-9 >= pair[0].start + pair[0].duration);
        }
        assert_eq!(segments[0].start, 0.0);
        assert!((segments[1].start - 1.0).abs() < 1e-9);
        assert!((segments[2].start - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_ending_the_session() {
        let mut h = harness(0.0);
        let now = Instant::now();
        let bad = SessionEvent::Frame {
            audio: Some(pcm_codec::EncodedFrame::new("@@@not-base64@@@".into(), 24000)),
            interrupted: false,
        };
        h.pipeline.handle_session_event(bad, now).await.unwrap();
        assert!(h.submitted.lock().unwrap().is_empty());

        // The stream keeps going.
        h.pipeline
            .handle_session_event(agent_frame(0.3, 2400), now)
            .await
            .unwrap();
        assert_eq!(h.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interruption_resets_clock_state_and_volume() {
        let mut h = harness(0.0);
        let now = Instant::now();
        for _ in 0..4 {
            h.pipeline
                .handle_session_event(agent_frame(0.5, 24000), now)
                .await
                .unwrap();
        }
        assert_eq!(h.pipeline.output_state(), ActivityState::Talking);

        let first_epoch = h.submitted.lock().unwrap()[0].epoch;
        h.pipeline
            .handle_session_event(
                SessionEvent::Frame {
                    audio: None,
                    interrupted: true,
                },
                now,
            )
            .await
            .unwrap();

        assert_eq!(h.pipeline.output_state(), ActivityState::Idle);
        assert_eq!(h.pipeline.volume(), 0.0);

        // Audio scheduled after the barge-in carries a newer epoch, so
        // the sink can tell pending stale segments apart.
        h.pipeline
            .handle_session_event(agent_frame(0.5, 2400), now)
            .await
            .unwrap();
        let segments = h.submitted.lock().unwrap();
        assert!(segments.last().unwrap().epoch > first_epoch);
        assert_eq!(segments.last().unwrap().start, 0.0);
    }

    #[tokio::test]
    async fn turn_complete_closes_the_utterance() {
        let mut h = harness(0.0);
        let now = Instant::now();
        h.pipeline
            .handle_session_event(agent_frame(0.5, 2400), now)
            .await
            .unwrap();
        assert_eq!(h.pipeline.output_state(), ActivityState::Talking);

        h.pipeline
            .handle_session_event(SessionEvent::TurnComplete, now)
            .await
            .unwrap();
        assert_eq!(h.pipeline.output_state(), ActivityState::Idle);
        assert_eq!(h.pipeline.volume(), 0.0);
    }

    #[tokio::test]
    async fn drain_heuristic_closes_the_utterance() {
        let mut h = harness(0.0);
        let now = Instant::now();
        // One 0.2s block; horizon ends at 0.2.
        h.pipeline
            .handle_session_event(agent_frame(0.5, 4800), now)
            .await
            .unwrap();
        assert_eq!(h.pipeline.output_state(), ActivityState::Talking);

        // Sink far from the horizon: still talking.
        h.pipeline.handle_sink_event(SinkEvent::SegmentDone { end: 0.0 });
        assert_eq!(h.pipeline.output_state(), ActivityState::Talking);

        // Sink within epsilon of the horizon: utterance over.
        h.pipeline.handle_sink_event(SinkEvent::SegmentDone { end: 0.15 });
        assert_eq!(h.pipeline.output_state(), ActivityState::Idle);
        assert_eq!(h.pipeline.volume(), 0.0);
    }

    #[tokio::test]
    async fn burst_delivery_keeps_every_segment() {
        // The agent streams far faster than real time; the sink clock
        // stays at 0 while a whole turn arrives. Every block must still
        // reach the sink, and the utterance stays open until the sink
        // has rendered all of it.
        let mut h = harness(0.0);
        let now = Instant::now();
        for _ in 0..100 {
            h.pipeline
                .handle_session_event(agent_frame(0.5, 4800), now)
                .await
                .unwrap();
        }

        {
            let segments = h.submitted.lock().unwrap();
            assert_eq!(segments.len(), 100);
            assert!((segments.last().unwrap().start - 19.8).abs() < 1e-6);
        }

        // Rendering is only partway through the queue: still talking.
        h.pipeline.handle_sink_event(SinkEvent::SegmentDone { end: 13.4 });
        assert_eq!(h.pipeline.output_state(), ActivityState::Talking);

        // The sink reached the horizon: utterance over.
        h.pipeline.handle_sink_event(SinkEvent::SegmentDone { end: 20.0 });
        assert_eq!(h.pipeline.output_state(), ActivityState::Idle);
        assert_eq!(h.pipeline.volume(), 0.0);
    }

    #[tokio::test]
    async fn closed_and_error_surface_per_policy() {
        let mut h = harness(0.0);
        let now = Instant::now();

        let err = h
            .pipeline
            .handle_session_event(SessionEvent::Error("boom".into()), now)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
        assert!(!h.pipeline.is_connected());

        let err = h
            .pipeline
            .handle_session_event(SessionEvent::Closed, now)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Closed));
    }

    #[tokio::test]
    async fn reset_restores_a_fresh_instance() {
        let mut h = harness(0.0);
        let now = Instant::now();
        h.pipeline
            .handle_session_event(agent_frame(0.5, 24000), now)
            .await
            .unwrap();
        h.pipeline.handle_capture_block(
            AudioBlock::new(vec![0.5; 4096], 16000),
            now,
        )
        .await;

        h.pipeline.reset();
        assert_eq!(h.pipeline.input_state(), ActivityState::Idle);
        assert_eq!(h.pipeline.output_state(), ActivityState::Idle);
        assert_eq!(h.pipeline.volume(), 0.0);
        assert!(!h.pipeline.is_connected());
    }
}
