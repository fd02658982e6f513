//! Wire format spoken with the chat endpoint.
//!
//! Every frame is a UTF-8 JSON object with a `type` field:
//!
//! ```text
//! join   {type, room, user}
//! chat   {type, room, user, text}
//! leave  {type, user}
//! ping   {type, ts}
//! pong   {type, ts}
//! ```
//!
//! Chat text may carry a send timestamp marker (`ts:<unix millis>`) used to measure
//! delivery latency on the receiving side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Token that introduces an embedded send timestamp inside chat text.
pub const TIMESTAMP_MARKER: &str = "ts:";

/// A protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Join {
        room: String,
        user: String,
    },
    Chat {
        room: String,
        user: String,
        text: String,
    },
    Leave {
        user: String,
    },
    /// `ts` is echoed verbatim, so it is kept as a raw json value.
    Ping {
        ts: Value,
    },
    Pong {
        ts: Value,
    },
}

impl Message {
    pub fn to_json(&self) -> String {
        // a tagged enum of strings and json values always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Chat { .. } => "chat",
            Self::Leave { .. } => "leave",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

/// What a session makes of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping { ts: Value },
    Chat { text: Option<String> },
    /// Well formed, but nothing a client has to react to (`join`, `leave`,
    /// `pong`, or a type this client does not know).
    Other(String),
}

impl Inbound {
    /// Decode an inbound text frame.
    ///
    /// Parsing is lenient about everything except the fields a client acts upon:
    /// unknown message types are `Other`, a chat without text is still a chat, but a
    /// ping without `ts` cannot be answered and is an error.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidJson("not an object".into()));
        };
        let kind = match obj.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => {
                return Err(ProtocolError::MissingField {
                    kind: "message",
                    field: "type",
                });
            }
        };
        match kind.as_str() {
            "ping" => match obj.remove("ts") {
                Some(ts) if !ts.is_null() => Ok(Self::Ping { ts }),
                _ => Err(ProtocolError::MissingField {
                    kind: "ping",
                    field: "ts",
                }),
            },
            "chat" => Ok(Self::Chat {
                text: match obj.remove("text") {
                    Some(Value::String(text)) => Some(text),
                    _ => None,
                },
            }),
            _ => Ok(Self::Other(kind)),
        }
    }

    /// Decode a binary frame, which must still hold UTF-8 JSON.
    pub fn parse_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::NotUtf8)?;
        Self::parse(text)
    }
}

/// Build chat text: `"{prefix} from {user}"`, then the optional timestamp marker,
/// right-padded with spaces to `size` bytes. Text already longer than `size` is
/// kept whole so the marker is never cut.
pub fn chat_text(prefix: &str, user: &str, sent_at_ms: Option<i64>, size: usize) -> String {
    let mut text = format!("{prefix} from {user}");
    if let Some(ts) = sent_at_ms {
        text.push('|');
        text.push_str(TIMESTAMP_MARKER);
        text.push_str(&ts.to_string());
    }
    if text.len() < size {
        let pad = size - text.len();
        text.extend(std::iter::repeat_n(' ', pad));
    }
    text
}

/// Find the first `ts:<digits>` marker in chat text.
pub fn extract_timestamp(text: &str) -> Option<i64> {
    text.match_indices(TIMESTAMP_MARKER).find_map(|(i, m)| {
        let rest = &text[i + m.len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        rest[..end].parse().ok()
    })
}
