//! Shared fakes for integration tests: a scripted codec, an in-memory
//! protocol, a recording board and a wake word engine fired on demand.

use fae_device::DeviceState;
use fae_device::audio::{AudioCodec, AudioFrame, SinkError, WakeWordEngine};
use fae_device::audio::pipeline::AudioSink;
use fae_device::board::{Board, ChatRole, Display, Led, NetworkStatus};
use fae_device::config::DeviceConfig;
use fae_device::error::ProtocolError;
use fae_device::protocol::{ControlMessage, Protocol, ProtocolListener};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Poll `cond` for up to three seconds.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// 16kHz in and out, 10ms frames, short queues.
pub(crate) fn test_config() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.audio.input_sample_rate = 16_000;
    config.audio.output_sample_rate = 16_000;
    config.audio.frame_duration_ms = 10;
    config.audio.encode_queue_capacity = 4;
    config.audio.send_queue_capacity = 4;
    config.audio.overrun_threshold_ms = 50;
    config.wakeword.enabled = false;
    config.app.max_connect_retries = 2;
    config.protocol.audio_format = "pcm16".to_owned();
    config
}

/// `n` samples all equal to `value`.
pub(crate) fn marker(value: i16, n: usize) -> Vec<i16> {
    vec![value; n]
}

/// Codec chip fake: plays back a capture script, then silence; records writes.
#[derive(Default)]
pub(crate) struct ScriptedCodec {
    pub script: Mutex<VecDeque<Vec<i16>>>,
    pub written: Mutex<Vec<Vec<i16>>>,
    pub reads: AtomicUsize,
    pub input_on: AtomicBool,
    pub volume: AtomicU8,
    /// While set, `write_frame` blocks as if the speaker were backed up.
    pub stall_output: AtomicBool,
}

impl ScriptedCodec {
    pub(crate) fn with_script(frames: Vec<Vec<i16>>) -> Self {
        let codec = Self::default();
        codec.script.lock().unwrap().extend(frames);
        codec
    }

    /// Count of written frames equal to `frame`.
    pub(crate) fn count_written(&self, frame: &[i16]) -> usize {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.as_slice() == frame)
            .count()
    }
}

impl AudioCodec for ScriptedCodec {
    fn input_sample_rate(&self) -> u32 {
        16_000
    }

    fn output_sample_rate(&self) -> u32 {
        16_000
    }

    fn read_frame(&self, samples: usize) -> fae_device::Result<Vec<i16>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(frame) = self.script.lock().unwrap().pop_front() {
            std::thread::sleep(Duration::from_millis(1));
            return Ok(frame);
        }
        std::thread::sleep(Duration::from_millis(2));
        Ok(vec![0; samples])
    }

    fn write_frame(&self, pcm: &[i16]) -> fae_device::Result<()> {
        while self.stall_output.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.written.lock().unwrap().push(pcm.to_vec());
        Ok(())
    }

    fn enable_input(&self, enabled: bool) {
        self.input_on.store(enabled, Ordering::SeqCst);
    }

    fn enable_output(&self, _enabled: bool) {}

    fn output_volume(&self) -> u8 {
        self.volume.load(Ordering::SeqCst)
    }

    fn set_output_volume(&self, volume: u8) {
        self.volume.store(volume, Ordering::SeqCst);
    }
}

/// Uplink sink that records frames, or refuses them all when `busy`.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub frames: Mutex<Vec<AudioFrame>>,
    pub busy: AtomicBool,
}

impl AudioSink for RecordingSink {
    fn send_audio(&self, frame: AudioFrame) -> Result<(), SinkError> {
        if self.busy.load(Ordering::SeqCst) {
            return Err(SinkError::Busy(frame));
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

/// Wake word engine that reports `keyword` on the first frame after `fire`.
pub(crate) struct TriggeredWakeWord {
    pub keyword: String,
    pub fire: Arc<AtomicBool>,
}

impl WakeWordEngine for TriggeredWakeWord {
    fn feed(&mut self, _pcm: &[i16]) -> Option<String> {
        self.fire
            .swap(false, Ordering::SeqCst)
            .then(|| self.keyword.clone())
    }

    fn reset(&mut self) {}
}

/// Protocol fake: records what the core sends and lets tests inject traffic.
#[derive(Default)]
pub(crate) struct MockProtocol {
    listener: Mutex<Option<Arc<dyn ProtocolListener>>>,
    connected: AtomicBool,
    pub connect_calls: AtomicU32,
    /// Connect attempts that fail before one succeeds.
    pub failing_connects: AtomicU32,
    pub controls: Mutex<Vec<ControlMessage>>,
    pub audio: Mutex<Vec<AudioFrame>>,
    pub closes: AtomicU32,
}

impl MockProtocol {
    /// Deliver a control message as if it came from the server.
    pub(crate) fn inject(&self, message: ControlMessage) {
        let listener = self.listener.lock().unwrap().clone();
        listener.expect("listener installed").on_control(message);
    }

    pub(crate) fn inject_audio(&self, frame: AudioFrame) {
        let listener = self.listener.lock().unwrap().clone();
        listener.expect("listener installed").on_audio(frame);
    }

    /// Drop the channel from the server side.
    pub(crate) fn drop_channel(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let listener = self.listener.lock().unwrap().clone();
        listener
            .expect("listener installed")
            .on_channel_closed(Some(reason.to_owned()));
    }

    pub(crate) fn sent(&self) -> Vec<ControlMessage> {
        self.controls.lock().unwrap().clone()
    }

    pub(crate) fn sent_count(&self, wanted: &ControlMessage) -> usize {
        self.sent().iter().filter(|m| *m == wanted).count()
    }
}

impl Protocol for MockProtocol {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn set_listener(&self, listener: Arc<dyn ProtocolListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn connect(&self) -> Result<(), ProtocolError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(ProtocolError::Connect("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send_control(&self, message: &ControlMessage) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        self.controls.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn send_audio(&self, frame: AudioFrame) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        self.audio.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<String> {
        self.is_connected().then(|| "mock-session".to_owned())
    }

    fn server_sample_rate(&self) -> u32 {
        16_000
    }
}

/// Board that records what the display and LED were told.
pub(crate) struct RecordingBoard {
    pub network: NetworkStatus,
    pub statuses: Mutex<Vec<String>>,
    pub chat: Mutex<Vec<(ChatRole, String)>>,
    pub alerts: Mutex<Vec<String>>,
    pub emotions: Mutex<Vec<String>>,
    pub led_states: Mutex<Vec<DeviceState>>,
    pub reboots: AtomicU32,
}

impl RecordingBoard {
    pub(crate) fn new(network: NetworkStatus) -> Self {
        Self {
            network,
            statuses: Mutex::default(),
            chat: Mutex::default(),
            alerts: Mutex::default(),
            emotions: Mutex::default(),
            led_states: Mutex::default(),
            reboots: AtomicU32::new(0),
        }
    }
}

impl Display for RecordingBoard {
    fn set_status(&self, status: &str) {
        self.statuses.lock().unwrap().push(status.to_owned());
    }

    fn set_emotion(&self, emotion: &str) {
        self.emotions.lock().unwrap().push(emotion.to_owned());
    }

    fn set_chat_message(&self, role: ChatRole, text: &str) {
        self.chat.lock().unwrap().push((role, text.to_owned()));
    }

    fn show_alert(&self, status: &str, message: &str, _emotion: Option<&str>) {
        self.alerts.lock().unwrap().push(format!("{status}: {message}"));
    }
}

impl Led for RecordingBoard {
    fn on_state_changed(&self, state: DeviceState) {
        self.led_states.lock().unwrap().push(state);
    }
}

impl Board for RecordingBoard {
    fn name(&self) -> &str {
        "test-board"
    }

    fn display(&self) -> &dyn Display {
        self
    }

    fn led(&self) -> &dyn Led {
        self
    }

    fn start_network(&self) -> NetworkStatus {
        self.network
    }

    fn network_status(&self) -> NetworkStatus {
        self.network
    }

    fn reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }
}
