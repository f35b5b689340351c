//! Wire messages of the bidirectional live service.
//!
//! Client messages serialize as single-key objects (`{"setup": {...}}`).
//! Server messages may combine several keys in one object, so they are
//! decoded into a flat struct and then split into ordered [`ServerEvent`]s.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::audio::AudioFrame;
use crate::config::{ApiConfig, LiveConfig};
use crate::error::{AuraError, Result};
use crate::gemini::types::{Content, InlineData};

/// Name of the single tool the session declares.
pub const PLAY_TRACK_TOOL: &str = "play_track";

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub input_audio_transcription: Value,
    pub output_audio_transcription: Value,
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<InlineData>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Parameters of the `setup` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
}

impl SessionSetup {
    pub fn from_config(api: &ApiConfig, live: &LiveConfig) -> Self {
        Self {
            model: api.live_model.clone(),
            voice_name: live.voice_name.clone(),
            system_instruction: live.system_instruction.clone(),
        }
    }

    /// Voice responses, transcription both ways, one tool.
    pub fn to_message(&self) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        ClientMessage::Setup(Setup {
            model,
            generation_config: json!({
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": self.voice_name }
                    }
                }
            }),
            system_instruction: self.system_instruction.as_deref().map(Content::system),
            input_audio_transcription: json!({}),
            output_audio_transcription: json!({}),
            tools: vec![json!({ "functionDeclarations": [play_track_declaration()] })],
        })
    }
}

/// Declaration of the "play a track" tool: `query` required, `artist` optional.
pub fn play_track_declaration() -> Value {
    json!({
        "name": PLAY_TRACK_TOOL,
        "description": "Play a music track for the user.",
        "parameters": {
            "type": "OBJECT",
            "properties": {
                "query": {
                    "type": "STRING",
                    "description": "Song title or free-text search for the track."
                },
                "artist": {
                    "type": "STRING",
                    "description": "Artist name, when the user mentioned one."
                }
            },
            "required": ["query"]
        }
    })
}

/// Wrap one captured frame for sending.
pub fn audio_message(frame: &AudioFrame) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![InlineData {
            mime_type: frame.mime_type(),
            data: base64::engine::general_purpose::STANDARD.encode(frame.data()),
        }],
    })
}

/// Acknowledge tool calls, keyed by call id.
pub fn tool_ack(calls: &[FunctionCall]) -> ClientMessage {
    ClientMessage::ToolResponse(ToolResponse {
        function_responses: calls
            .iter()
            .map(|call| FunctionResponse {
                id: call.id.clone(),
                name: call.name.clone(),
                response: json!({ "result": "ok" }),
            })
            .collect(),
    })
}

// ── Server side ──

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMessage {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    #[serde(default)]
    time_left: Option<String>,
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// One decoded server signal, in the order it must be handled.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// Barge-in: the model stopped speaking because the user started.
    Interrupted,
    /// Decoded 16-bit PCM from the model.
    Audio(Vec<u8>),
    InputTranscript(String),
    OutputTranscript(String),
    TurnComplete,
    ToolCalls(Vec<FunctionCall>),
    GoAway(Option<String>),
}

/// Decode one server frame (text or binary, both JSON).
///
/// # Errors
///
/// [`AuraError::Protocol`] when the frame is not a JSON object.
pub fn parse_server_message(payload: &[u8]) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_slice(payload)
        .map_err(|e| AuraError::Protocol(format!("undecodable server message: {e}")))?;

    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }
    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        for part in content.model_turn.into_iter().flat_map(|turn| turn.parts) {
            let Some(inline) = part.inline_data else {
                continue;
            };
            if !inline.mime_type.starts_with("audio/") {
                continue;
            }
            match base64::engine::general_purpose::STANDARD.decode(inline.data.as_bytes()) {
                Ok(bytes) => events.push(ServerEvent::Audio(bytes)),
                Err(e) => warn!(error = %e, "dropping undecodable audio part"),
            }
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::InputTranscript(t.text));
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::OutputTranscript(t.text));
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }
    if let Some(call) = message.tool_call.filter(|c| !c.function_calls.is_empty()) {
        events.push(ServerEvent::ToolCalls(call.function_calls));
    }
    if let Some(go_away) = message.go_away {
        events.push(ServerEvent::GoAway(go_away.time_left));
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json(message: &ClientMessage) -> Value {
        serde_json::to_value(message).expect("serialize")
    }

    // ── Client messages ──

    #[test]
    fn setup_requests_audio_transcripts_and_tool() {
        let setup = SessionSetup {
            model: "gemini-live".into(),
            voice_name: "Puck".into(),
            system_instruction: Some("be brief".into()),
        };
        let json = to_json(&setup.to_message());
        let body = &json["setup"];
        assert_eq!(body["model"], "models/gemini-live");
        assert_eq!(body["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            body["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(body["inputAudioTranscription"].is_object());
        assert!(body["outputAudioTranscription"].is_object());

        let tool = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(tool["name"], PLAY_TRACK_TOOL);
        assert_eq!(tool["parameters"]["required"], json!(["query"]));
        assert_eq!(tool["parameters"]["properties"]["artist"]["type"], "STRING");
    }

    #[test]
    fn setup_keeps_qualified_model_name() {
        let setup = SessionSetup {
            model: "models/x".into(),
            voice_name: "Kore".into(),
            system_instruction: None,
        };
        let json = to_json(&setup.to_message());
        assert_eq!(json["setup"]["model"], "models/x");
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn audio_message_is_base64_pcm_with_rate() {
        let frame = AudioFrame::from_samples(&[0.5, -0.5], 16_000);
        let json = to_json(&audio_message(&frame));
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        let data = chunk["data"].as_str().expect("string");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .expect("base64");
        assert_eq!(bytes, frame.data());
    }

    #[test]
    fn tool_ack_is_keyed_by_call_id() {
        let calls = vec![FunctionCall {
            id: "call-7".into(),
            name: PLAY_TRACK_TOOL.into(),
            args: json!({"query": "Blue in Green"}),
        }];
        let json = to_json(&tool_ack(&calls));
        let response = &json["toolResponse"]["functionResponses"][0];
        assert_eq!(response["id"], "call-7");
        assert_eq!(response["name"], PLAY_TRACK_TOOL);
        assert_eq!(response["response"]["result"], "ok");
    }

    // ── Server messages ──

    #[test]
    fn parses_setup_complete() {
        let events = parse_server_message(br#"{"setupComplete":{}}"#).expect("parse");
        assert_eq!(events, vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn parses_server_content_in_order() {
        let audio = base64::engine::general_purpose::STANDARD.encode([1u8, 0, 2, 0]);
        let payload = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": audio}},
                    {"text": "ignored"}
                ]},
                "outputTranscription": {"text": "Hi"},
                "inputTranscription": {"text": "Hello"},
                "turnComplete": true
            }
        });
        let events = parse_server_message(payload.to_string().as_bytes()).expect("parse");
        assert_eq!(
            events,
            vec![
                ServerEvent::Audio(vec![1, 0, 2, 0]),
                ServerEvent::InputTranscript("Hello".into()),
                ServerEvent::OutputTranscript("Hi".into()),
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn interrupted_comes_first() {
        let events =
            parse_server_message(br#"{"serverContent":{"interrupted":true}}"#).expect("parse");
        assert_eq!(events, vec![ServerEvent::Interrupted]);
    }

    #[test]
    fn parses_tool_call() {
        let payload = br#"{"toolCall":{"functionCalls":[{"id":"a1","name":"play_track","args":{"query":"So What","artist":"Miles Davis"}}]}}"#;
        let events = parse_server_message(payload).expect("parse");
        match &events[..] {
            [ServerEvent::ToolCalls(calls)] => {
                assert_eq!(calls[0].id, "a1");
                assert_eq!(calls[0].args["artist"], "Miles Davis");
            }
            other => unreachable!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn parses_go_away_and_ignores_unknown_keys() {
        let events =
            parse_server_message(br#"{"goAway":{"timeLeft":"10s"},"usageMetadata":{"x":1}}"#)
                .expect("parse");
        assert_eq!(events, vec![ServerEvent::GoAway(Some("10s".into()))]);
        assert!(
            parse_server_message(br#"{"usageMetadata":{}}"#)
                .expect("parse")
                .is_empty()
        );
    }

    #[test]
    fn bad_audio_part_is_skipped() {
        let payload = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"!!!"}}]}}}"#;
        assert!(parse_server_message(payload).expect("parse").is_empty());
    }

    #[test]
    fn non_json_is_protocol_error() {
        assert!(matches!(
            parse_server_message(b"hello"),
            Err(AuraError::Protocol(_))
        ));
    }
}
