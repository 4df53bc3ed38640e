use crate::multipart::{MultipartMessage, Part};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// API version prefix shared by the events and directives paths
pub const API_VERSION: &str = "v20160207";
pub const DIRECTIVES_PATH: &str = "/v20160207/directives";
pub const EVENTS_PATH: &str = "/v20160207/events";
pub const PING_PATH: &str = "/ping";

/// Boundary used for every outbound event body
pub const EVENT_BOUNDARY: &str = "avs-event-boundary";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const AUDIO_CONTENT_TYPE: &str = "application/octet-stream";

pub const RECOGNIZE_PROFILE: &str = "CLOSE_TALK";
pub const RECOGNIZE_FORMAT: &str = "AUDIO_L16_RATE_16000_CHANNELS_1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub namespace: String,
    pub name: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialog_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Value,
}

impl Event {
    /// `System.SynchronizeState` with an empty payload
    pub fn synchronize_state(message_id: String) -> Self {
        Self {
            header: EventHeader {
                namespace: "System".to_string(),
                name: "SynchronizeState".to_string(),
                message_id,
                dialog_request_id: None,
            },
            payload: Value::Object(Default::default()),
        }
    }

    /// `SpeechRecognizer.Recognize` for close-talk 16 kHz mono L16 audio
    pub fn recognize(message_id: String, dialog_request_id: String) -> Self {
        Self {
            header: EventHeader {
                namespace: "SpeechRecognizer".to_string(),
                name: "Recognize".to_string(),
                message_id,
                dialog_request_id: Some(dialog_request_id),
            },
            payload: serde_json::json!({
                "profile": RECOGNIZE_PROFILE,
                "format": RECOGNIZE_FORMAT,
            }),
        }
    }
}

/// JSON document sent as the metadata part of an event body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope<'a> {
    pub context: &'a Value,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveHeader {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub dialog_request_id: Option<String>,
}

/// An instruction from the service, e.g. `SpeechSynthesizer.Speak`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub header: DirectiveHeader,
    #[serde(default)]
    pub payload: Value,
}

impl Directive {
    /// Content-ID referenced by a `cid:` URL in the payload, if any
    pub fn attachment_id(&self) -> Option<&str> {
        self.payload
            .get("url")
            .and_then(Value::as_str)
            .and_then(|url| url.strip_prefix("cid:"))
    }
}

#[derive(Deserialize)]
struct DirectiveDocument {
    directive: Directive,
}

/// A decoded response: its directives and binary attachments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvsResponse {
    pub directives: Vec<Directive>,
    pub attachments: Vec<(String, Bytes)>,
}

impl AvsResponse {
    /// Split a decoded multipart/related body into directives and attachments
    pub fn from_multipart(message: &MultipartMessage) -> Result<Self, serde_json::Error> {
        let mut response = AvsResponse::default();

        for (index, part) in message.parts.iter().enumerate() {
            if part.is_json() {
                let document: DirectiveDocument = serde_json::from_slice(&part.content)?;
                response.directives.push(document.directive);
            } else {
                response
                    .attachments
                    .push((attachment_key(part, index), part.content.clone()));
            }
        }

        Ok(response)
    }

    pub fn attachment(&self, key: &str) -> Option<&Bytes> {
        self.attachments
            .iter()
            .find(|(id, _)| id == key)
            .map(|(_, content)| content)
    }

    /// Audio to play back: the attachment a directive points at, else the first one
    pub fn audio(&self) -> Option<&Bytes> {
        self.directives
            .iter()
            .filter_map(Directive::attachment_id)
            .find_map(|id| self.attachment(id))
            .or_else(|| self.attachments.first().map(|(_, content)| content))
    }

    pub fn into_audio(self) -> Option<Bytes> {
        self.audio().cloned()
    }
}

fn attachment_key(part: &Part, index: usize) -> String {
    part.content_id()
        .or_else(|| part.name())
        .map(str::to_string)
        .unwrap_or_else(|| format!("part-{}", index))
}
