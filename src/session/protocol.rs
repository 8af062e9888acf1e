//! Conversation service message definitions
//!
//! Outbound messages are JSON objects with a single top-level key. Inbound
//! messages are decoded leniently: every field is optional and anything
//! unrecognized is ignored rather than treated as an error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Who produced a piece of transcribed text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// Token accounting reported by the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
}

/// Classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Decoded PCM from an inline audio part of a model turn
    AudioChunk(Vec<u8>),
    /// Transcribed or generated text
    TranscriptionFragment { role: Role, text: String },
    /// The model finished its turn
    TurnComplete,
    /// Token accounting
    UsageReport(UsageReport),
    /// Error or shutdown notice from the service
    ErrorNotice(String),
    /// Anything not recognized
    Ignored,
}

// ---------------------------------------------------------------------------
// Outbound

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'a str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    media_chunks: Option<[MediaChunk<'a>; 1]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: String,
}

/// Mime descriptor for captured PCM at `sample_rate`
pub fn audio_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// One-time setup message sent when the connection opens
pub fn setup_message(
    model: &str,
    voice: &str,
    system_instruction: Option<&str>,
) -> Result<String, serde_json::Error> {
    let model = if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    };

    serde_json::to_string(&SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice { voice_name: voice },
                    },
                },
            },
            system_instruction: system_instruction
                .filter(|text| !text.trim().is_empty())
                .map(|text| Content {
                    parts: [TextPart { text }],
                }),
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        },
    })
}

/// Realtime-input envelope carrying one base64-encoded PCM chunk
pub fn audio_message(pcm: &[u8], mime_type: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: Some([MediaChunk {
                mime_type,
                data: BASE64.encode(pcm),
            }]),
            audio_stream_end: None,
        },
    })
}

/// "No more input for now" signal ending the user's turn
pub fn turn_boundary_message() -> Result<String, serde_json::Error> {
    serde_json::to_string(&RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: None,
            audio_stream_end: Some(true),
        },
    })
}

// ---------------------------------------------------------------------------
// Inbound

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

/// Typed view of `object[key]`; a missing or mistyped field reads as absent
fn field<T: DeserializeOwned>(object: &Value, key: &str) -> Option<T> {
    let value = object.get(key).filter(|value| !value.is_null())?;
    match T::deserialize(value) {
        Ok(typed) => Some(typed),
        Err(e) => {
            debug!(field = key, error = %e, "ignoring mistyped inbound field");
            None
        }
    }
}

/// Token count sent either as a number or as a numeric string
fn token_count(object: &Value, key: &str) -> Option<u64> {
    let value = object.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn transcript(role: Role, content: &Value, key: &str) -> Option<InboundMessage> {
    let text: String = content.get(key).and_then(|t| field(t, "text"))?;
    if text.is_empty() {
        return None;
    }
    Some(InboundMessage::TranscriptionFragment { role, text })
}

fn decode_error(error: &Value) -> InboundMessage {
    let code: Option<i64> = field(error, "code");
    let message: Option<String> = field(error, "message");
    let detail = match (code, message) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (None, Some(message)) => message,
        (Some(code), None) => format!("error code {}", code),
        (None, None) => "unspecified error".to_string(),
    };
    InboundMessage::ErrorNotice(detail)
}

fn decode_content(content: &Value, out: &mut Vec<InboundMessage>) {
    let parts = content
        .get("modelTurn")
        .and_then(|turn| turn.get("parts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for part in parts {
        let part = match Part::deserialize(part) {
            Ok(part) => part,
            Err(e) => {
                debug!(error = %e, "dropping malformed content part");
                continue;
            }
        };
        if let Some(inline) = part.inline_data {
            if !inline.mime_type.starts_with("audio/") {
                continue;
            }
            match BASE64.decode(inline.data.as_bytes()) {
                Ok(bytes) if !bytes.is_empty() => out.push(InboundMessage::AudioChunk(bytes)),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "dropping undecodable audio part"),
            }
        } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            out.push(InboundMessage::TranscriptionFragment {
                role: Role::Model,
                text,
            });
        }
    }

    out.extend(transcript(Role::User, content, "inputTranscription"));
    out.extend(transcript(Role::Model, content, "outputTranscription"));

    if field::<bool>(content, "turnComplete").unwrap_or(false) {
        out.push(InboundMessage::TurnComplete);
    }
}

fn decode_usage(usage: &Value) -> InboundMessage {
    let prompt_tokens = token_count(usage, "promptTokenCount").unwrap_or(0);
    let response_tokens = token_count(usage, "responseTokenCount")
        .or_else(|| token_count(usage, "candidatesTokenCount"))
        .unwrap_or(0);
    InboundMessage::UsageReport(UsageReport {
        prompt_tokens,
        response_tokens,
        total_tokens: token_count(usage, "totalTokenCount")
            .unwrap_or(prompt_tokens.saturating_add(response_tokens)),
    })
}

/// Classify one inbound frame
///
/// A frame may carry several payloads (e.g. turn completion alongside
/// usage); each recognized payload becomes one message, and a damaged
/// payload does not take the others down with it. A frame with nothing
/// recognizable yields a single [`InboundMessage::Ignored`].
pub fn decode_inbound(frame: &str) -> Vec<InboundMessage> {
    let message: Value = match serde_json::from_str(frame) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "dropping malformed inbound frame");
            return vec![InboundMessage::Ignored];
        }
    };

    let mut out = Vec::new();

    if let Some(error) = message.get("error").filter(|v| v.is_object()) {
        out.push(decode_error(error));
    }

    if let Some(go_away) = message.get("goAway").filter(|v| v.is_object()) {
        let time_left: Option<String> = field(go_away, "timeLeft");
        out.push(InboundMessage::ErrorNotice(format!(
            "service is closing the session (time left: {})",
            time_left.as_deref().unwrap_or("unknown")
        )));
    }

    if let Some(content) = message.get("serverContent").filter(|v| v.is_object()) {
        decode_content(content, &mut out);
    }

    if let Some(usage) = message.get("usageMetadata").filter(|v| v.is_object()) {
        out.push(decode_usage(usage));
    }

    if out.is_empty() {
        out.push(InboundMessage::Ignored);
    }
    out
}
