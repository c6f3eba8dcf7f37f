//! Fae device: the control core of a voice-assistant device.
//!
//! The device captures microphone audio, listens for a wake word, streams
//! encoded voice to a conversational server and plays back the synthesized
//! reply. The server can ask the device to act through remote tool calls.
//!
//! # Architecture
//!
//! - **State**: one authoritative [`DeviceState`] guarded by a transition table
//! - **Audio**: capture → VAD / wake word → encode → send, and
//!   receive → decode → playback, on dedicated worker threads
//! - **Protocol**: a streaming WebSocket transport or a split
//!   control-channel + encrypted datagram transport behind [`Protocol`]
//! - **Tools**: a frozen registry of MCP tools dispatched off the core thread
//! - **Application**: a single event loop that owns the session and
//!   coordinates everything above

pub mod app;
pub mod audio;
pub mod board;
pub mod config;
pub mod error;
pub mod mcp;
pub mod protocol;
pub mod state;

pub use app::{AppEvent, AppParts, Application, CoreHandle};
pub use config::DeviceConfig;
pub use error::{DeviceError, Result};
pub use protocol::{Protocol, ProtocolListener};
pub use state::{DeviceState, StateMachine};
