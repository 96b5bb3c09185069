//! Session bridge: the duplex channel between the pipeline and the
//! remote agent.
//!
//! The pipeline depends only on `SessionEvent`/`SessionCommand`;
//! `SessionLink` is the concrete WebSocket bridge that speaks the wire
//! format. It makes exactly one connect attempt per invocation —
//! reconnection is the caller's decision.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::audio::pcm_codec::EncodedFrame;
use crate::config::{Config, SessionSetup};

/// Inbound events the pipeline consumes.
#[derive(Debug)]
pub enum SessionEvent {
    Opened,
    /// Agent audio and/or a barge-in marker. A server message can signal
    /// interruption without carrying audio, hence the `Option`.
    Frame {
        audio: Option<EncodedFrame>,
        interrupted: bool,
    },
    /// Explicit end of the agent's utterance.
    TurnComplete,
    /// Transcript of the user's speech, forwarded unmodified.
    InputTranscript(String),
    /// Transcript of the agent's speech, forwarded unmodified.
    OutputTranscript(String),
    Closed,
    Error(String),
}

/// Outbound traffic the pipeline produces.
#[derive(Debug)]
pub enum SessionCommand {
    SendFrame(EncodedFrame),
    SendText(String),
}

// ======================== Wire format ========================

#[derive(Serialize)]
struct MediaChunk<'a> {
    data: &'a str,
    #[serde(rename = "mimeType")]
    mime_type: &'a str,
}

#[derive(Serialize)]
struct OutboundMedia<'a> {
    media: MediaChunk<'a>,
}

#[derive(Serialize)]
struct OutboundText<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    server_content: Option<ServerContent>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    interrupted: Option<bool>,
    turn_complete: Option<bool>,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    data: String,
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct Transcription {
    text: String,
}

/// Translate one server text message into pipeline events. Messages the
/// core does not consume produce nothing.
fn parse_server_message(text: &str) -> Vec<SessionEvent> {
    let Ok(msg) = serde_json::from_str::<ServerMessage>(text) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if let Some(content) = msg.server_content {
        let audio = content.model_turn.and_then(|turn| {
            turn.parts
                .into_iter()
                .next()
                .and_then(|p| p.inline_data)
                .map(|d| EncodedFrame {
                    data: d.data,
                    mime_type: d
                        .mime_type
                        .unwrap_or_else(|| "audio/pcm;rate=24000".to_string()),
                })
        });
        let interrupted = content.interrupted.unwrap_or(false);
        if audio.is_some() || interrupted {
            events.push(SessionEvent::Frame { audio, interrupted });
        }
        if content.turn_complete.unwrap_or(false) {
            events.push(SessionEvent::TurnComplete);
        }
    }
    if let Some(t) = msg.input_transcription {
        events.push(SessionEvent::InputTranscript(t.text));
    }
    if let Some(t) = msg.output_transcription {
        events.push(SessionEvent::OutputTranscript(t.text));
    }
    events
}

/// Build the connect-time setup message from the opaque config block.
fn setup_message(setup: &SessionSetup) -> serde_json::Value {
    let mut msg = json!({
        "setup": {
            "responseModalities": [setup.response_modality],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": setup.voice }
                }
            },
        }
    });
    let body = &mut msg["setup"];
    if setup.input_transcription {
        body["inputAudioTranscription"] = json!({});
    }
    if setup.output_transcription {
        body["outputAudioTranscription"] = json!({});
    }
    if !setup.system_instruction.is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{ "text": setup.system_instruction }]
        });
    }
    msg
}

// ======================== WebSocket bridge ========================

pub struct SessionLink {
    config: Config,
    tx: mpsc::Sender<SessionEvent>,
    rx_cmd: mpsc::Receiver<SessionCommand>,
}

impl SessionLink {
    pub fn new(
        config: Config,
        tx: mpsc::Sender<SessionEvent>,
        rx_cmd: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        Self { config, tx, rx_cmd }
    }

    /// One connect attempt, then pump until the session ends.
    pub async fn run(mut self) {
        match self.connect_and_pump().await {
            Ok(()) => {
                let _ = self.tx.send(SessionEvent::Closed).await;
            }
            Err(e) => {
                let _ = self.tx.send(SessionEvent::Error(format!("{:#}", e))).await;
            }
        }
    }

    async fn connect_and_pump(&mut self) -> anyhow::Result<()> {
        let url = Url::parse(&self.config.ws_url)?;
        log::info!("Connecting to {}", url);

        let request = {
            let mut builder = tokio_tungstenite::tungstenite::http::Request::builder()
                .method("GET")
                .uri(self.config.ws_url.as_str())
                .header("Host", url.host_str().unwrap_or_default())
                .header("Connection", "Upgrade")
                .header("Upgrade", "websocket")
                .header("Sec-WebSocket-Version", "13")
                .header(
                    "Sec-WebSocket-Key",
                    tokio_tungstenite::tungstenite::handshake::client::generate_key(),
                );
            if !self.config.ws_token.is_empty() {
                builder = builder
                    .header("Authorization", format!("Bearer {}", self.config.ws_token));
            }
            builder.body(())?
        };

        let (ws_stream, _) = connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        self.tx.send(SessionEvent::Opened).await?;

        let setup = setup_message(&self.config.session);
        write.send(Message::Text(setup.to_string().into())).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse_server_message(&text) {
                                self.tx.send(event).await?;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed the session: {:?}", frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(SessionCommand::SendFrame(frame)) => {
                            let chunk = OutboundMedia {
                                media: MediaChunk {
                                    data: &frame.data,
                                    mime_type: &frame.mime_type,
                                },
                            };
                            write.send(Message::Text(serde_json::to_string(&chunk)?.into())).await?;
                        }
                        Some(SessionCommand::SendText(text)) => {
                            let payload = OutboundText { text: &text };
                            write.send(Message::Text(serde_json::to_string(&payload)?.into())).await?;
                        }
                        // Pipeline dropped its sender: clean shutdown.
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_frame_is_extracted_from_model_turn() {
        let events = parse_server_message(
            r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAAA","mimeType":"audio/pcm;rate=24000"}}]}}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Frame { audio: Some(frame), interrupted } => {
                assert_eq!(frame.data, "AAAA");
                assert_eq!(frame.sample_rate(), Some(24000));
                assert!(!*interrupted);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn interruption_without_audio_still_produces_a_frame_event() {
        let events = parse_server_message(r#"{"serverContent":{"interrupted":true}}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SessionEvent::Frame {
                audio: None,
                interrupted: true
            }
        ));
    }

    #[test]
    fn turn_complete_and_transcripts_are_forwarded() {
        let events = parse_server_message(
            r#"{"serverContent":{"turnComplete":true},"outputTranscription":{"text":"hi there"}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::TurnComplete));
        match &events[1] {
            SessionEvent::OutputTranscript(text) => assert_eq!(text, "hi there"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn unrelated_messages_produce_nothing() {
        assert!(parse_server_message(r#"{"setupComplete":{}}"#).is_empty());
        assert!(parse_server_message("not json at all").is_empty());
    }

    #[test]
    fn outbound_frame_wire_shape() {
        let chunk = OutboundMedia {
            media: MediaChunk {
                data: "UExBWQ==",
                mime_type: "audio/pcm;rate=16000",
            },
        };
        assert_eq!(
            serde_json::to_string(&chunk).unwrap(),
            r#"{"media":{"data":"UExBWQ==","mimeType":"audio/pcm;rate=16000"}}"#
        );
    }

    #[test]
    fn setup_message_reflects_the_config_block() {
        let mut setup = SessionSetup::default();
        setup.system_instruction = "be brief".to_string();
        setup.input_transcription = false;

        let msg = setup_message(&setup);
        assert_eq!(msg["setup"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            msg["setup"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert!(msg["setup"]["inputAudioTranscription"].is_null());
        assert!(msg["setup"]["outputAudioTranscription"].is_object());
        assert_eq!(
            msg["setup"]["systemInstruction"]["parts"][0]["text"],
            "be brief"
        );
    }
}
