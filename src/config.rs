//! Configuration types for the device core.

use crate::error::{DeviceError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identity sent to the server.
    pub device: IdentityConfig,
    /// Audio frame timing, queue sizes and device names.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Wake word detection (MFCC+DTW keyword spotter).
    pub wakeword: WakewordConfig,
    /// Server connection settings.
    pub protocol: ProtocolConfig,
    /// Application core behaviour.
    pub app: AppConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable hardware id (MAC address on real boards).
    pub device_id: String,
    /// Per-install client id. Generated when empty.
    pub client_id: String,
    /// Board name reported in device status.
    pub board: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id: "00:00:00:00:00:00".to_owned(),
            client_id: String::new(),
            board: "host".to_owned(),
        }
    }
}

impl IdentityConfig {
    /// Client id, generating a fresh v4 UUID if none is configured.
    pub fn ensure_client_id(&mut self) -> &str {
        if self.client_id.trim().is_empty() {
            self.client_id = uuid::Uuid::new_v4().to_string();
        }
        &self.client_id
    }
}

/// Audio frame timing and queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz.
    pub output_sample_rate: u32,
    /// Duration of one frame in ms. Capture and uplink run at this period.
    pub frame_duration_ms: u32,
    /// Raw PCM frames waiting for the encoder.
    pub encode_queue_capacity: usize,
    /// Encoded frames waiting to be sent.
    pub send_queue_capacity: usize,
    /// Encoded frames waiting for the decoder.
    pub decode_queue_capacity: usize,
    /// Decoded frames waiting for the speaker.
    pub playback_queue_capacity: usize,
    /// How long a producer may stall on a full queue before it is reported.
    pub overrun_threshold_ms: u64,
    /// Speaker amplifier is switched off after this much silence.
    pub output_idle_timeout_ms: u64,
    /// Input device name (None = system default). Host builds only.
    pub input_device: Option<String>,
    /// Output device name (None = system default). Host builds only.
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_duration_ms: 60,
            encode_queue_capacity: 16,
            send_queue_capacity: 32,
            decode_queue_capacity: 32,
            playback_queue_capacity: 16,
            overrun_threshold_ms: 2_000,
            output_idle_timeout_ms: 10_000,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Samples in one capture frame.
    #[must_use]
    pub fn input_frame_samples(&self) -> usize {
        (self.input_sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Samples in one playback frame.
    #[must_use]
    pub fn output_frame_samples(&self) -> usize {
        (self.output_sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech, on samples normalised to \[-1, 1\].
    pub threshold: f32,
    /// Silent frames tolerated before the decision flips back to silence.
    pub hangover_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            hangover_frames: 5,
        }
    }
}

/// Wake word detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakewordConfig {
    /// Whether detection is enabled while idle.
    pub enabled: bool,
    /// Keyword text reported to the server on detection.
    pub keyword: String,
    /// Directory containing 16kHz mono WAV recordings of the keyword.
    pub references_dir: PathBuf,
    /// DTW distance threshold; lower is stricter.
    pub threshold: f32,
    /// MFCC coefficients per frame (0 = default).
    pub num_mfcc: usize,
}

impl Default for WakewordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyword: "hi fae".to_owned(),
            references_dir: default_data_dir().join("wakeword"),
            threshold: 25.0,
            num_mfcc: 13,
        }
    }
}

/// Streaming (single WebSocket) server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    pub url: String,
    pub token: String,
    /// Binary framing version (1, 2 or 3).
    pub version: u8,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/device/v1/".to_owned(),
            token: String::new(),
            version: 1,
        }
    }
}

/// Split (control channel + UDP datagrams) server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// `host:port` of the reliable control endpoint.
    pub control_addr: String,
    /// Idle seconds before a control keepalive is sent (0 disables).
    pub keepalive_secs: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            control_addr: "127.0.0.1:8883".to_owned(),
            keepalive_secs: 90,
        }
    }
}

/// Server connection configuration.
///
/// Which variant is used is decided once at startup: streaming when
/// `websocket` is present, otherwise split when `split` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Uplink codec name announced in the hello (`audio_params.format`).
    pub audio_format: String,
    /// How long to wait for the server hello.
    pub hello_timeout_ms: u64,
    pub websocket: Option<WebsocketConfig>,
    pub split: Option<SplitConfig>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            audio_format: "opus".to_owned(),
            hello_timeout_ms: 10_000,
            websocket: None,
            split: None,
        }
    }
}

/// How a listening turn ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Server decides end of speech; device returns to listening after TTS.
    #[default]
    AutoStop,
    /// Push-to-talk: device decides end of speech, returns to idle after TTS.
    ManualStop,
    /// Full duplex: keep the microphone open while speaking.
    Realtime,
}

impl ListeningMode {
    /// Wire value for the `listen` message `mode` field.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::AutoStop => "auto",
            Self::ManualStop => "manual",
            Self::Realtime => "realtime",
        }
    }
}

/// Where a failed firmware upgrade may return to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeFailureTarget {
    #[default]
    Idle,
    Activating,
    /// No outgoing edge; only a reset leaves `Upgrading`.
    ResetOnly,
}

/// Application core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Listening mode used for wake word sessions.
    pub listening_mode: ListeningMode,
    /// Connect attempts retried after the first failure.
    pub max_connect_retries: u32,
    /// Core event backlog that logs a warning. The queue itself is unbounded.
    pub event_queue_warn_depth: usize,
    /// Exit edge for `Upgrading`.
    pub upgrade_failure: UpgradeFailureTarget,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listening_mode: ListeningMode::AutoStop,
            max_connect_retries: 2,
            event_queue_warn_depth: 64,
            upgrade_failure: UpgradeFailureTarget::Idle,
        }
    }
}

/// Log output configuration (host binary only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files. Stderr only when unset.
    pub directory: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("fae-device"))
        .unwrap_or_else(|| PathBuf::from("/tmp").join("fae-device"))
}

impl DeviceConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| DeviceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| DeviceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/fae-device/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("fae-device").join("config.toml")
        } else if let Some(dir) = dirs::config_dir() {
            dir.join("fae-device").join("config.toml")
        } else {
            PathBuf::from("/tmp/fae-device/config.toml")
        }
    }

    /// Check values the core cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let a = &self.audio;
        if a.input_sample_rate == 0 || a.output_sample_rate == 0 {
            return Err(DeviceError::Config("sample rates must be non-zero".into()));
        }
        if a.frame_duration_ms == 0 || a.input_frame_samples() == 0 {
            return Err(DeviceError::Config(
                "frame_duration_ms must yield at least one sample".into(),
            ));
        }
        for (name, cap) in [
            ("encode_queue_capacity", a.encode_queue_capacity),
            ("send_queue_capacity", a.send_queue_capacity),
            ("decode_queue_capacity", a.decode_queue_capacity),
            ("playback_queue_capacity", a.playback_queue_capacity),
        ] {
            if cap == 0 {
                return Err(DeviceError::Config(format!("audio.{name} must be > 0")));
            }
        }
        if self.app.event_queue_warn_depth == 0 {
            return Err(DeviceError::Config(
                "app.event_queue_warn_depth must be > 0".into(),
            ));
        }
        if let Some(ws) = &self.protocol.websocket {
            if !(1..=3).contains(&ws.version) {
                return Err(DeviceError::Config(format!(
                    "protocol.websocket.version must be 1, 2 or 3, got {}",
                    ws.version
                )));
            }
            url::Url::parse(&ws.url)
                .map_err(|e| DeviceError::Config(format!("protocol.websocket.url: {e}")))?;
        }
        if let Some(split) = &self.protocol.split
            && split.control_addr.trim().is_empty()
        {
            return Err(DeviceError::Config(
                "protocol.split.control_addr is empty".into(),
            ));
        }
        Ok(())
    }

    /// Check the announced `protocol.audio_format` against the codecs that
    /// will actually produce and consume frames.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Config`] on a mismatch.
    pub fn validate_codec(&self, encoder: &str, decoder: &str) -> Result<()> {
        let announced = self.protocol.audio_format.as_str();
        for (side, format) in [("encoder", encoder), ("decoder", decoder)] {
            if format != announced {
                return Err(DeviceError::Config(format!(
                    "protocol.audio_format is {announced:?} but the {side} speaks {format:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DeviceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.input_frame_samples(), 960);
        assert_eq!(config.audio.output_frame_samples(), 1440);
        assert!(config.protocol.websocket.is_none());
        assert!(config.protocol.split.is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DeviceConfig::default();
        config.app.listening_mode = ListeningMode::Realtime;
        config.protocol.websocket = Some(WebsocketConfig {
            url: "wss://example.test/ws".into(),
            token: "secret".into(),
            version: 3,
        });
        config.save_to_file(&path).unwrap();

        let loaded = DeviceConfig::from_file(&path).unwrap();
        assert_eq!(loaded.app.listening_mode, ListeningMode::Realtime);
        let ws = loaded.protocol.websocket.unwrap();
        assert_eq!(ws.version, 3);
        assert_eq!(ws.token, "secret");
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = DeviceConfig::from_file(std::path::Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is [not valid toml").unwrap();
        assert!(matches!(
            DeviceConfig::from_file(&path),
            Err(DeviceError::Config(_))
        ));
    }

    #[test]
    fn partial_sections_use_defaults() {
        let toml_str = r#"
[audio]
frame_duration_ms = 20

[protocol.split]
control_addr = "10.0.0.2:9000"

[app]
upgrade_failure = "reset_only"
event_queue_warn_depth = 16
"#;
        let config: DeviceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.audio.frame_duration_ms, 20);
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.input_frame_samples(), 320);
        assert_eq!(config.app.upgrade_failure, UpgradeFailureTarget::ResetOnly);
        assert_eq!(config.app.event_queue_warn_depth, 16);
        let split = config.protocol.split.unwrap();
        assert_eq!(split.control_addr, "10.0.0.2:9000");
        assert_eq!(split.keepalive_secs, 90);
    }

    #[test]
    fn validate_rejects_bad_websocket_version() {
        let mut config = DeviceConfig::default();
        config.protocol.websocket = Some(WebsocketConfig {
            version: 4,
            ..WebsocketConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = DeviceConfig::default();
        config.audio.send_queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("send_queue_capacity"));
    }

    #[test]
    fn announced_format_must_match_codecs() {
        let mut config = DeviceConfig::default();
        let err = config.validate_codec("pcm16", "pcm16").unwrap_err();
        assert!(err.to_string().contains("encoder"));

        config.protocol.audio_format = "pcm16".to_owned();
        config.validate_codec("pcm16", "pcm16").unwrap();
        let err = config.validate_codec("pcm16", "opus").unwrap_err();
        assert!(err.to_string().contains("decoder"));
    }

    #[test]
    fn ensure_client_id_generates_once() {
        let mut identity = IdentityConfig::default();
        let first = identity.ensure_client_id().to_owned();
        assert_eq!(first.len(), 36);
        assert_eq!(identity.ensure_client_id(), first);
    }

    #[test]
    fn listening_mode_wire_names() {
        assert_eq!(ListeningMode::AutoStop.as_wire(), "auto");
        assert_eq!(ListeningMode::ManualStop.as_wire(), "manual");
        assert_eq!(ListeningMode::Realtime.as_wire(), "realtime");
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = DeviceConfig::default_config_path();
        assert!(path.ends_with("fae-device/config.toml"));
    }
}
