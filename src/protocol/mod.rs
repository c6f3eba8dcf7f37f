//! Server protocol abstraction.
//!
//! A [`Protocol`] carries control messages and audio frames to and from the
//! server. Two variants exist: [`websocket::WebsocketProtocol`] sends both over
//! one WebSocket, and [`split::SplitProtocol`] sends control over a reliable
//! channel and audio over encrypted UDP datagrams. Which one is used is
//! decided once at startup by [`select_protocol`].
//!
//! Protocols never reconnect on their own. A dropped channel is reported to
//! the [`ProtocolListener`] and the core decides what to do next.

pub mod binary;
pub mod message;
pub(crate) mod net;
pub mod split;
pub mod websocket;

pub use message::{ControlMessage, Envelope, ListenState, MessageKind, TtsState};

use crate::audio::frame::AudioFrame;
use crate::config::DeviceConfig;
use crate::error::{DeviceError, ProtocolError, Result};
use message::{AudioParams, Hello, UdpParams};
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Receives inbound traffic. Called on the transport's own thread; must not
/// block for long.
pub trait ProtocolListener: Send + Sync {
    fn on_control(&self, message: ControlMessage);

    /// Runs on the transport's receive thread and may block it while the
    /// downlink is backed up; `Protocol::close` waits for it to return.
    fn on_audio(&self, frame: AudioFrame);

    /// The channel dropped without a local `close()`.
    fn on_channel_closed(&self, reason: Option<String>);
}

/// A connection to the conversational server.
pub trait Protocol: Send + Sync {
    /// Transport name used in the hello (`websocket` or `udp`).
    fn name(&self) -> &'static str;

    /// Install the inbound listener. Replaces any previous one.
    fn set_listener(&self, listener: Arc<dyn ProtocolListener>);

    /// Open the channel and complete the hello handshake. Blocks; call it
    /// from a network thread.
    ///
    /// # Errors
    ///
    /// Connect, timeout and handshake failures. `close()` from another
    /// thread makes a pending connect return [`ProtocolError::Closed`].
    fn connect(&self) -> std::result::Result<(), ProtocolError>;

    /// # Errors
    ///
    /// [`ProtocolError::NotConnected`] when no session is open.
    fn send_control(&self, message: &ControlMessage) -> std::result::Result<(), ProtocolError>;

    /// Send one encoded audio frame. Never blocks on the network.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::NotConnected`] when no session is open, or
    /// [`ProtocolError::InvalidFrame`] for a PCM frame.
    fn send_audio(&self, frame: AudioFrame) -> std::result::Result<(), ProtocolError>;

    /// Close the session. Idempotent.
    fn close(&self);

    fn is_connected(&self) -> bool;

    /// Session id from the last server hello.
    fn session_id(&self) -> Option<String>;

    /// Sample rate of downlink audio announced by the server.
    fn server_sample_rate(&self) -> u32;
}

/// Device-side hello parameters.
#[derive(Debug, Clone)]
pub struct HelloSettings {
    pub audio_format: String,
    /// Uplink sample rate.
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub timeout: Duration,
    /// Assumed downlink rate when the server hello omits one.
    pub default_server_rate: u32,
}

impl HelloSettings {
    #[must_use]
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            audio_format: config.protocol.audio_format.clone(),
            sample_rate: config.audio.input_sample_rate,
            frame_duration_ms: config.audio.frame_duration_ms,
            timeout: Duration::from_millis(config.protocol.hello_timeout_ms),
            default_server_rate: config.audio.output_sample_rate,
        }
    }

    /// The hello the device opens a session with.
    #[must_use]
    pub fn device_hello(&self, version: u8, transport: &str) -> ControlMessage {
        ControlMessage::Hello(Hello {
            version: Some(version),
            transport: Some(transport.to_owned()),
            features: Some(json!({ "mcp": true })),
            audio_params: Some(AudioParams {
                format: self.audio_format.clone(),
                sample_rate: self.sample_rate,
                channels: 1,
                frame_duration: self.frame_duration_ms,
            }),
            udp: None,
        })
    }
}

/// What the server told us in its hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub session_id: Option<String>,
    pub sample_rate: u32,
    pub udp: Option<UdpParams>,
}

impl ServerHello {
    fn from_message(hello: Hello, session_id: Option<String>, default_rate: u32) -> Self {
        Self {
            session_id,
            sample_rate: hello
                .audio_params
                .map(|p| p.sample_rate)
                .filter(|&r| r > 0)
                .unwrap_or(default_rate),
            udp: hello.udp,
        }
    }
}

/// Shared listener slot used by both variants.
#[derive(Default)]
pub(crate) struct ListenerSlot(RwLock<Option<Arc<dyn ProtocolListener>>>);

impl ListenerSlot {
    pub(crate) fn set(&self, listener: Arc<dyn ProtocolListener>) {
        *self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(listener);
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn ProtocolListener>> {
        self.0
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Build the protocol the configuration asks for: streaming when
/// `[protocol.websocket]` is present, otherwise split when
/// `[protocol.split]` is present.
///
/// # Errors
///
/// Returns [`DeviceError::Config`] if neither is configured or the chosen
/// variant's settings are invalid.
pub fn select_protocol(config: &DeviceConfig) -> Result<Arc<dyn Protocol>> {
    let hello = HelloSettings::from_config(config);
    let mut identity = config.device.clone();
    identity.ensure_client_id();

    if let Some(ws) = &config.protocol.websocket {
        info!("using streaming protocol: {}", ws.url);
        let protocol = websocket::WebsocketProtocol::new(ws.clone(), identity, hello)?;
        return Ok(Arc::new(protocol));
    }
    if let Some(split) = &config.protocol.split {
        info!("using split protocol: control {}", split.control_addr);
        let control = split::TcpControlChannel::new(&split.control_addr, hello.timeout);
        let protocol = split::SplitProtocol::new(
            Box::new(control),
            Box::new(split::UdpDatagramChannel::new()),
            hello,
            Duration::from_secs(split.keepalive_secs),
        );
        return Ok(Arc::new(protocol));
    }
    Err(DeviceError::Config(
        "no protocol configured: set [protocol.websocket] or [protocol.split]".into(),
    ))
}
