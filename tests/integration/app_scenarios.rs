//! Application core scenarios driven through fake hardware and a fake server.

use crate::helpers::{
    MockProtocol, RecordingBoard, ScriptedCodec, TriggeredWakeWord, marker, test_config,
    wait_until,
};
use fae_device::audio::sounds::{EXCLAMATION, POPUP};
use fae_device::audio::{AudioFrame, Pcm16Codec, SoundBank, WakeWordEngine};
use fae_device::board::{ChatRole, NetworkStatus};
use fae_device::config::DeviceConfig;
use fae_device::error::DeviceError;
use fae_device::mcp::{ParameterSchema, ToolDescriptor};
use fae_device::protocol::{ControlMessage, ListenState, Protocol, TtsState};
use fae_device::state::StateReader;
use fae_device::{AppParts, Application, CoreHandle, DeviceState};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const FRAME: usize = 160;

fn popup() -> Vec<i16> {
    marker(4_242, FRAME)
}

fn exclamation() -> Vec<i16> {
    marker(777, FRAME)
}

fn sounds() -> SoundBank {
    let mut bank = SoundBank::empty(16_000);
    bank.insert(POPUP, popup());
    bank.insert(EXCLAMATION, exclamation());
    bank
}

struct Harness {
    codec: Arc<ScriptedCodec>,
    protocol: Arc<MockProtocol>,
    board: Arc<RecordingBoard>,
    wake: Arc<AtomicBool>,
    handle: CoreHandle,
    state: StateReader,
    thread: Option<JoinHandle<fae_device::Result<()>>>,
}

impl Harness {
    fn start(network: NetworkStatus) -> Self {
        Self::start_with(network, MockProtocol::default(), |_| {})
    }

    fn start_with(
        network: NetworkStatus,
        protocol: MockProtocol,
        configure: impl FnOnce(&mut DeviceConfig),
    ) -> Self {
        let mut config = test_config();
        configure(&mut config);
        let codec = Arc::new(ScriptedCodec::default());
        codec.volume.store(60, Ordering::SeqCst);
        let protocol = Arc::new(protocol);
        let board = Arc::new(RecordingBoard::new(network));
        let wake = Arc::new(AtomicBool::new(false));
        let engine: Box<dyn WakeWordEngine> = Box::new(TriggeredWakeWord {
            keyword: "hi fae".into(),
            fire: Arc::clone(&wake),
        });

        let app = Application::new(
            &config,
            AppParts {
                codec: codec.clone(),
                encoder: Box::new(Pcm16Codec),
                decoder: Box::new(Pcm16Codec),
                wake_word: Some(engine),
                sounds: sounds(),
                protocol: protocol.clone(),
                board: board.clone(),
                tools: Vec::new(),
            },
        )
        .unwrap();
        let handle = app.handle();
        let state = app.state_reader();
        let thread = std::thread::spawn(move || app.run());

        Self {
            codec,
            protocol,
            board,
            wake,
            handle,
            state,
            thread: Some(thread),
        }
    }

    fn wait_state(&self, state: DeviceState) -> bool {
        wait_until(|| self.state.get() == state)
    }

    /// Run `f` on the core thread and return its result.
    fn query<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut Application) -> T + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        assert!(self.handle.schedule(move |app| {
            let _ = tx.send(f(app));
        }));
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    /// Poll `check` on the core thread until it holds.
    fn eventually(&self, check: fn(&mut Application) -> bool) -> bool {
        wait_until(|| self.query(check))
    }

    fn wake_up(&self) {
        assert!(self.eventually(|app| app.pipeline().is_wake_word_detection()));
        self.wake.store(true, Ordering::SeqCst);
    }

    fn shutdown(&mut self) -> fae_device::Result<()> {
        self.handle.shutdown();
        match self.thread.take() {
            Some(thread) => thread.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn listen(state: ListenState, mode: Option<&str>, text: Option<&str>) -> ControlMessage {
    ControlMessage::listen(state, mode, text)
}

fn tts(state: TtsState) -> ControlMessage {
    ControlMessage::Tts { state, text: None }
}

#[test]
fn boots_through_activation_to_idle() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    assert!(h.query(|app| app.pipeline().is_running()));
    assert!(h.eventually(|app| app.pipeline().is_wake_word_detection()));
    assert!(!h.query(|app| app.pipeline().is_voice_processing()));
    assert!(wait_until(|| h.board.led_states.lock().unwrap().len() == 2));
    assert_eq!(
        *h.board.led_states.lock().unwrap(),
        vec![DeviceState::Activating, DeviceState::Idle]
    );
    assert!(h.board.statuses.lock().unwrap().contains(&"Standby".to_owned()));
}

#[test]
fn unprovisioned_network_enters_wifi_configuring() {
    let h = Harness::start(NetworkStatus::NeedsProvisioning);
    assert!(h.wait_state(DeviceState::WifiConfiguring));
    assert!(h.eventually(|app| !app.pipeline().is_wake_word_detection()));
}

#[test]
fn wake_word_opens_session_and_listens() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.wake_up();

    assert!(h.wait_state(DeviceState::Listening));
    assert!(wait_until(|| h.board.led_states.lock().unwrap().len() == 4));
    assert_eq!(
        *h.board.led_states.lock().unwrap(),
        vec![
            DeviceState::Activating,
            DeviceState::Idle,
            DeviceState::Connecting,
            DeviceState::Listening
        ]
    );
    assert!(h.eventually(|app| app.pipeline().is_voice_processing()));
    assert!(h.eventually(|app| !app.pipeline().is_wake_word_detection()));

    assert_eq!(
        h.protocol.sent(),
        vec![
            listen(ListenState::Detect, None, Some("hi fae")),
            listen(ListenState::Start, Some("auto"), None),
        ]
    );

    assert!(wait_until(|| h.codec.count_written(&popup()) == 1));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.codec.count_written(&popup()), 1);

    // Captured audio streams to the server while listening.
    assert!(wait_until(|| !h.protocol.audio.lock().unwrap().is_empty()));
    assert!(h.protocol.audio.lock().unwrap().iter().all(AudioFrame::is_encoded));
}

#[test]
fn manual_turn_speaks_then_returns_to_idle_and_reuses_session() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));

    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));
    assert_eq!(
        h.protocol.sent(),
        vec![listen(ListenState::Start, Some("manual"), None)]
    );

    h.protocol.inject(ControlMessage::Stt {
        text: "what time is it".into(),
    });
    h.protocol.inject(tts(TtsState::Start));
    assert!(h.wait_state(DeviceState::Speaking));
    h.protocol.inject(ControlMessage::Tts {
        state: TtsState::SentenceStart,
        text: Some("It is noon.".into()),
    });

    let speech = marker(1_500, FRAME);
    let bytes: Vec<u8> = speech.iter().flat_map(|s| s.to_le_bytes()).collect();
    h.protocol
        .inject_audio(AudioFrame::encoded(bytes, 16_000, 0));
    assert!(wait_until(|| h.codec.count_written(&speech) == 1));

    h.protocol.inject(tts(TtsState::Stop));
    assert!(h.wait_state(DeviceState::Idle));
    assert_eq!(
        *h.board.chat.lock().unwrap(),
        vec![
            (ChatRole::User, "what time is it".to_owned()),
            (ChatRole::Assistant, "It is noon.".to_owned()),
        ]
    );

    // The open session is reused for the next turn.
    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));
    assert_eq!(h.protocol.connect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.protocol
            .sent_count(&listen(ListenState::Start, Some("manual"), None)),
        2
    );

    h.handle.stop_listening();
    assert!(h.wait_state(DeviceState::Idle));
    assert_eq!(h.protocol.sent_count(&listen(ListenState::Stop, None, None)), 1);
}

#[test]
fn auto_mode_resumes_listening_after_speech() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.wake_up();
    assert!(h.wait_state(DeviceState::Listening));

    h.protocol.inject(tts(TtsState::Start));
    assert!(h.wait_state(DeviceState::Speaking));
    h.protocol.inject(tts(TtsState::Stop));
    assert!(wait_until(|| h
        .protocol
        .sent_count(&listen(ListenState::Start, Some("auto"), None))
        == 2));
    assert!(h.wait_state(DeviceState::Listening));
}

#[test]
fn downlink_audio_outside_speaking_is_dropped() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));

    let speech = marker(2_500, FRAME);
    let bytes: Vec<u8> = speech.iter().flat_map(|s| s.to_le_bytes()).collect();
    h.protocol
        .inject_audio(AudioFrame::encoded(bytes, 16_000, 0));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.codec.count_written(&speech), 0);
}

#[test]
fn wake_word_interrupts_speech() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.wake_up();
    assert!(h.wait_state(DeviceState::Listening));
    h.protocol.inject(tts(TtsState::Start));
    assert!(h.wait_state(DeviceState::Speaking));

    h.wake_up();
    assert!(wait_until(|| h.protocol.sent_count(&ControlMessage::abort(Some(
        "wake_word_detected"
    ))) == 1));
    assert!(h.wait_state(DeviceState::Listening));
    let sent = h.protocol.sent();
    assert_eq!(
        sent.last(),
        Some(&listen(ListenState::Start, Some("auto"), None))
    );
}

#[test]
fn connect_failures_retry_then_give_up() {
    let protocol = MockProtocol::default();
    protocol.failing_connects.store(10, Ordering::SeqCst);
    let h = Harness::start_with(NetworkStatus::Connected, protocol, |_| {});
    assert!(h.wait_state(DeviceState::Idle));

    h.handle.start_listening();
    assert!(wait_until(|| h.protocol.connect_calls.load(Ordering::SeqCst) == 3));
    assert!(wait_until(|| !h.board.alerts.lock().unwrap().is_empty()));
    assert!(h.wait_state(DeviceState::Idle));
    assert!(wait_until(|| h.codec.count_written(&exclamation()) == 1));

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.protocol.connect_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.codec.count_written(&popup()), 0);
    assert!(h.query(|app| app.session().is_none()));
}

#[test]
fn single_connect_failure_is_retried() {
    let protocol = MockProtocol::default();
    protocol.failing_connects.store(1, Ordering::SeqCst);
    let h = Harness::start_with(NetworkStatus::Connected, protocol, |_| {});
    assert!(h.wait_state(DeviceState::Idle));

    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));
    assert_eq!(h.protocol.connect_calls.load(Ordering::SeqCst), 2);
    assert!(h.board.alerts.lock().unwrap().is_empty());
}

#[test]
fn server_dropping_the_channel_returns_to_idle() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));

    h.protocol.drop_channel("server restarted");
    assert!(h.wait_state(DeviceState::Idle));
    assert!(wait_until(|| h
        .board
        .alerts
        .lock()
        .unwrap()
        .iter()
        .any(|a| a.contains("server restarted"))));
    assert!(h.query(|app| app.session().is_none()));
}

#[test]
fn goodbye_and_reboot_from_server() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));

    h.protocol.inject(ControlMessage::System {
        command: "reboot".into(),
    });
    assert!(wait_until(|| h.board.reboots.load(Ordering::SeqCst) == 1));

    h.protocol.inject(ControlMessage::Goodbye);
    assert!(h.wait_state(DeviceState::Idle));
    assert!(h.protocol.closes.load(Ordering::SeqCst) >= 1);
    assert!(!h.protocol.is_connected());
}

#[test]
fn tool_calls_act_on_the_device_and_reply() {
    let h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));

    h.protocol.inject(ControlMessage::mcp(json!({
        "jsonrpc": "2.0", "id": 7, "method": "tools/call",
        "params": {"name": "self.audio_speaker.set_volume", "arguments": {"volume": 30}},
    })));
    assert!(wait_until(|| h.codec.volume.load(Ordering::SeqCst) == 30));

    h.protocol.inject(ControlMessage::mcp(json!({
        "jsonrpc": "2.0", "id": 8, "method": "tools/call",
        "params": {"name": "self.get_device_status", "arguments": {}},
    })));
    h.protocol.inject(ControlMessage::mcp(json!({
        "jsonrpc": "2.0", "id": 9, "method": "tools/call",
        "params": {"name": "self.audio_speaker.set_volume", "arguments": {"volume": "loud"}},
    })));
    h.protocol.inject(ControlMessage::mcp(json!({
        "jsonrpc": "2.0", "id": 10, "method": "tools/call",
        "params": {"name": "self.audio_speaker.play_sound", "arguments": {"sound": "exclamation"}},
    })));

    let reply = |id: i64| {
        h.protocol.sent().into_iter().find_map(|m| match m {
            ControlMessage::Mcp { payload } if payload["id"] == id => Some(payload),
            _ => None,
        })
    };
    assert!(wait_until(|| (7..=10).all(|id| reply(id).is_some())));

    assert_eq!(reply(7).unwrap()["result"]["isError"], false);
    let status = reply(8).unwrap()["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .to_owned();
    let status: serde_json::Value = serde_json::from_str(&status).unwrap();
    assert_eq!(status["audio_speaker"]["volume"], 30);
    assert_eq!(status["state"], "listening");
    assert_eq!(status["board"], "test-board");
    assert_eq!(reply(9).unwrap()["error"]["code"], -32602);
    assert!(wait_until(|| h.codec.count_written(&exclamation()) == 1));
}

#[test]
fn duplicate_board_tool_fails_construction() {
    let config = test_config();
    let result = Application::new(
        &config,
        AppParts {
            codec: Arc::new(ScriptedCodec::default()),
            encoder: Box::new(Pcm16Codec),
            decoder: Box::new(Pcm16Codec),
            wake_word: None,
            sounds: sounds(),
            protocol: Arc::new(MockProtocol::default()),
            board: Arc::new(RecordingBoard::new(NetworkStatus::Connected)),
            tools: vec![ToolDescriptor::new(
                "self.get_device_status",
                "Shadowing a built-in.",
                ParameterSchema::new(),
                |_| Ok(json!(null)),
            )],
        },
    );
    assert!(matches!(result, Err(DeviceError::Registry(_))));
}

#[test]
fn announced_format_the_codec_cannot_speak_fails_construction() {
    let mut config = test_config();
    config.protocol.audio_format = "opus".to_owned();
    let result = Application::new(
        &config,
        AppParts {
            codec: Arc::new(ScriptedCodec::default()),
            encoder: Box::new(Pcm16Codec),
            decoder: Box::new(Pcm16Codec),
            wake_word: None,
            sounds: sounds(),
            protocol: Arc::new(MockProtocol::default()),
            board: Arc::new(RecordingBoard::new(NetworkStatus::Connected)),
            tools: Vec::new(),
        },
    );
    assert!(matches!(result, Err(DeviceError::Config(_))));
}

#[test]
fn shutdown_stops_pipeline_and_closes_protocol() {
    let mut h = Harness::start(NetworkStatus::Connected);
    assert!(h.wait_state(DeviceState::Idle));
    h.handle.start_listening();
    assert!(h.wait_state(DeviceState::Listening));

    h.shutdown().unwrap();
    assert!(!h.codec.input_on.load(Ordering::SeqCst));
    assert!(!h.protocol.is_connected());
    assert!(!h.handle.start_listening());
}
