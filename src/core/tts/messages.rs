//! WebSocket message types for the multi-context TTS API.
//!
//! - **Outgoing messages**: [`OutgoingMessage`] (`text`, `eos`, `close`), each
//!   correlated by `context_id`.
//! - **Incoming messages**: [`InboundMessage`], normalized from the raw JSON.
//!   The service spells some fields two ways (`context_id` / `contextId`,
//!   `is_final` / `isFinal`); both spellings land in the same field here.

use serde::{Deserialize, Deserializer, Serialize};

/// Error message used when the service omits one
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

// =============================================================================
// Outgoing Messages (Client to Server)
// =============================================================================

/// Message sent from the client to the service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutgoingMessage {
    /// Submit text for synthesis
    Text {
        context_id: String,
        text: String,
        flush: bool,
    },
    /// No more text will be sent for this context
    Eos { context_id: String },
    /// Tear the context down on the service side
    Close { context_id: String },
}

impl OutgoingMessage {
    #[inline]
    pub fn text(context_id: impl Into<String>, text: impl Into<String>, flush: bool) -> Self {
        OutgoingMessage::Text {
            context_id: context_id.into(),
            text: text.into(),
            flush,
        }
    }

    #[inline]
    pub fn eos(context_id: impl Into<String>) -> Self {
        OutgoingMessage::Eos {
            context_id: context_id.into(),
        }
    }

    #[inline]
    pub fn close(context_id: impl Into<String>) -> Self {
        OutgoingMessage::Close {
            context_id: context_id.into(),
        }
    }

    pub fn context_id(&self) -> &str {
        match self {
            OutgoingMessage::Text { context_id, .. }
            | OutgoingMessage::Eos { context_id }
            | OutgoingMessage::Close { context_id } => context_id,
        }
    }

    /// Serialize to the JSON text frame sent on the wire
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Incoming Messages (Server to Client)
// =============================================================================

/// Raw shape of every inbound frame.
///
/// All fields are optional; the category is decided by which fields are present.
#[derive(Debug, Default, Deserialize)]
struct RawInbound {
    #[serde(default, alias = "contextId")]
    context_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, alias = "isFinal", deserialize_with = "null_as_false")]
    is_final: bool,
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Error record reported by the service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceErrorRecord {
    /// Present for context-scoped errors, absent for connection-scoped ones
    pub context_id: Option<String>,
    pub error_code: String,
    pub message: String,
}

/// Audio record for one context
#[derive(Debug, Clone, PartialEq)]
pub struct AudioRecord {
    pub context_id: String,
    /// Base64 audio payload, not yet decoded
    pub audio: String,
    pub is_final: bool,
}

/// Normalized inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Error(ServiceErrorRecord),
    Audio(AudioRecord),
    /// Any shape that is neither an error nor a routable audio record
    Unrecognized,
}

impl InboundMessage {
    /// Parse a WebSocket text frame into a normalized message.
    ///
    /// An `error` field wins over everything else. An `audio` field needs a
    /// non-empty context id to be routable; without one the frame is
    /// `Unrecognized`.
    ///
    /// # Returns
    /// * `Result<Self, serde_json::Error>` - Parsed message or parse error for non-JSON input
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawInbound = serde_json::from_str(text)?;

        let context_id = raw.context_id.filter(|id| !id.is_empty());

        if let Some(error_code) = raw.error {
            return Ok(InboundMessage::Error(ServiceErrorRecord {
                context_id,
                error_code,
                message: raw
                    .message
                    .unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string()),
            }));
        }

        match (raw.audio, context_id) {
            (Some(audio), Some(context_id)) => Ok(InboundMessage::Audio(AudioRecord {
                context_id,
                audio,
                is_final: raw.is_final,
            })),
            _ => Ok(InboundMessage::Unrecognized),
        }
    }

    /// Context id the message is addressed to, if any
    pub fn context_id(&self) -> Option<&str> {
        match self {
            InboundMessage::Error(record) => record.context_id.as_deref(),
            InboundMessage::Audio(record) => Some(&record.context_id),
            InboundMessage::Unrecognized => None,
        }
    }
}
