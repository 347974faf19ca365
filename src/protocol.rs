//! Realtime API message types
//!
//! Every message on the socket is a JSON object discriminated by `type`.
//! [`Envelope`] is that shape with the remaining fields kept opaque; the
//! typed events below are the handful the client acts on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

pub const SESSION_UPDATE: &str = "session.update";
pub const INPUT_AUDIO_BUFFER_APPEND: &str = "input_audio_buffer.append";
pub const RESPONSE_AUDIO_DELTA: &str = "response.audio.delta";
pub const SPEECH_STARTED: &str = "input_audio_buffer.speech_started";
pub const ERROR: &str = "error";

/// Structured message: a type tag plus arbitrary associated fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    fn str_field(&self, field: &'static str) -> Result<&str, ProtocolError> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                kind: self.kind.clone(),
                field,
            })
    }
}

/// Session settings carried by `session.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: String,
}

/// Messages the client sends
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SessionUpdate(SessionSettings),
    InputAudioAppend { audio: String },
}

impl ClientEvent {
    pub fn session_update(instructions: impl Into<String>, voice: impl Into<String>) -> Self {
        ClientEvent::SessionUpdate(SessionSettings {
            instructions: instructions.into(),
            voice: voice.into(),
        })
    }

    pub fn append_audio(audio: String) -> Self {
        ClientEvent::InputAudioAppend { audio }
    }
}

impl From<ClientEvent> for Envelope {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::SessionUpdate(settings) => Envelope::new(SESSION_UPDATE).with_field(
                "session",
                serde_json::json!({
                    "instructions": settings.instructions,
                    "voice": settings.voice,
                }),
            ),
            ClientEvent::InputAudioAppend { audio } => {
                Envelope::new(INPUT_AUDIO_BUFFER_APPEND).with_field("audio", audio)
            }
        }
    }
}

/// Messages the client reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Base64 PCM16 fragment of the spoken response
    AudioDelta { delta: String },
    /// The remote VAD heard the user start talking
    SpeechStarted,
    /// Remote-side error report
    RemoteError { message: String },
    /// Anything else, passed through untouched
    Other(Envelope),
}

impl TryFrom<Envelope> for ServerEvent {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.kind.as_str() {
            RESPONSE_AUDIO_DELTA => Ok(ServerEvent::AudioDelta {
                delta: envelope.str_field("delta")?.to_string(),
            }),
            SPEECH_STARTED => Ok(ServerEvent::SpeechStarted),
            ERROR => {
                let message = envelope
                    .fields
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                Ok(ServerEvent::RemoteError { message })
            }
            _ => Ok(ServerEvent::Other(envelope)),
        }
    }
}
