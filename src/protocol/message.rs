//! Control messages exchanged with the server.
//!
//! Every control message is a JSON object with a `type` discriminator and an
//! optional `session_id`. Both protocol variants carry exactly this schema;
//! only the transport underneath differs.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `audio_params` block of a hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Frame duration in ms.
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_owned(),
            sample_rate: 16_000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

/// Datagram endpoint announced by the server hello (split variant only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpParams {
    pub server: String,
    pub port: u16,
    /// Hex-encoded payload key.
    pub key: String,
    /// Hex-encoded 16-byte packet header template.
    pub nonce: String,
}

/// Session handshake, sent by the device first and answered by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_params: Option<AudioParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    /// Wake word spotted; `text` carries the keyword.
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
}

/// A control message, discriminated by its wire `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello(Hello),
    Listen {
        state: ListenState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Goodbye,
    Tts {
        state: TtsState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Stt {
        #[serde(default)]
        text: String,
    },
    /// LLM status: emotion and an optional short text.
    Llm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Tool call (inbound) or tool result (outbound).
    Mcp { payload: Value },
    System {
        command: String,
    },
    Alert {
        #[serde(default)]
        status: String,
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
    },
    Custom {
        #[serde(default)]
        payload: Value,
    },
}

/// What a control message is for, independent of wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    Listen,
    Abort,
    Goodbye,
    Tts,
    Stt,
    LlmStatus,
    McpToolCall,
    McpToolResult,
    System,
    Alert,
    Custom,
}

impl ControlMessage {
    /// Classify the message. `mcp` payloads carrying a `result` or `error`
    /// without a `method`/`tool` are results; everything else is a call.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Hello(_) => MessageKind::Hello,
            Self::Listen { .. } => MessageKind::Listen,
            Self::Abort { .. } => MessageKind::Abort,
            Self::Goodbye => MessageKind::Goodbye,
            Self::Tts { .. } => MessageKind::Tts,
            Self::Stt { .. } => MessageKind::Stt,
            Self::Llm { .. } => MessageKind::LlmStatus,
            Self::Mcp { payload } => {
                let is_request = payload.get("method").is_some() || payload.get("tool").is_some();
                let is_reply = payload.get("result").is_some() || payload.get("error").is_some();
                if is_reply && !is_request {
                    MessageKind::McpToolResult
                } else {
                    MessageKind::McpToolCall
                }
            }
            Self::System { .. } => MessageKind::System,
            Self::Alert { .. } => MessageKind::Alert,
            Self::Custom { .. } => MessageKind::Custom,
        }
    }

    /// Wire `type` value.
    #[must_use]
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Listen { .. } => "listen",
            Self::Abort { .. } => "abort",
            Self::Goodbye => "goodbye",
            Self::Tts { .. } => "tts",
            Self::Stt { .. } => "stt",
            Self::Llm { .. } => "llm",
            Self::Mcp { .. } => "mcp",
            Self::System { .. } => "system",
            Self::Alert { .. } => "alert",
            Self::Custom { .. } => "custom",
        }
    }

    #[must_use]
    pub fn listen(state: ListenState, mode: Option<&str>, text: Option<&str>) -> Self {
        Self::Listen {
            state,
            mode: mode.map(str::to_owned),
            text: text.map(str::to_owned),
        }
    }

    #[must_use]
    pub fn abort(reason: Option<&str>) -> Self {
        Self::Abort {
            reason: reason.map(str::to_owned),
        }
    }

    #[must_use]
    pub fn mcp(payload: Value) -> Self {
        Self::Mcp { payload }
    }

    /// Serialize for the wire, stamping `session_id` when one is known.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Send`] if serialization fails.
    pub fn to_wire(&self, session_id: Option<&str>) -> Result<String, ProtocolError> {
        let envelope = Envelope {
            session_id: session_id.map(str::to_owned),
            message: self.clone(),
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Send(e.to_string()))
    }

    /// Parse a wire message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed JSON or unknown types.
    pub fn parse(text: &str) -> Result<Envelope, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// A control message plus the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub message: ControlMessage,
}
