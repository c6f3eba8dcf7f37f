//! Error types for the device core.

use crate::state::DeviceState;

/// Top-level error type for the device core.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Audio device or pipeline stage error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Encoder/decoder failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Rejected state transition.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// Connect/send/receive failure on the protocol layer.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Tool invocation failure.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Tool registration failure (fatal at startup).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// A state transition the state machine refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTransition {
    /// `(from, to)` is not in the transition table.
    #[error("invalid transition {from} -> {to}")]
    NotAllowed { from: DeviceState, to: DeviceState },

    /// A listener tried to transition while notification was still running.
    #[error("transition in progress, cannot move to {requested}")]
    InProgress { requested: DeviceState },
}

/// Protocol layer failures. Surfaced to the core as events, never retried here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Transport-level connect failure.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Server did not answer in time (connect or hello).
    #[error("timed out: {0}")]
    Timeout(String),

    /// The channel was closed locally or by the server.
    #[error("channel closed: {0}")]
    Closed(String),

    /// Outbound send failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Inbound data could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Server hello was missing or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame of the wrong kind was handed to the transport.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Operation needs an open audio channel.
    #[error("not connected")]
    NotConnected,
}

/// Structured tool failure returned to the remote caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {name}")]
    NotFound { name: String },

    #[error("invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("tool {name} failed: {message}")]
    ExecutionFailed { name: String, message: String },
}

impl ToolError {
    /// Stable wire identifier for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "tool_not_found",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::ExecutionFailed { .. } => "tool_execution_failed",
        }
    }

    /// JSON-RPC error code used when the call arrived as `tools/call`.
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::NotFound { .. } => -32601,
            Self::InvalidArguments { .. } => -32602,
            Self::ExecutionFailed { .. } => -32603,
        }
    }
}

/// Tool registration errors. These are configuration bugs, reported at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("invalid tool name: {0:?}")]
    InvalidName(String),
}
