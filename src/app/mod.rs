//! The application core.
//!
//! One thread owns the state machine, the pipeline toggles and the session.
//! Everything else (audio workers, network threads, tool threads, buttons)
//! talks to it by posting an [`AppEvent`] through a [`CoreHandle`]. The loop
//! blocks for the first event, then drains everything already queued before
//! blocking again.

pub mod session;

pub use session::{PendingAction, Session};

use crate::audio::codec::{AudioCodec, AudioDecoder, AudioEncoder};
use crate::audio::frame::AudioFrame;
use crate::audio::pipeline::{
    AudioPipeline, AudioSink, InboundHandle, PipelineEvent, PipelineObserver, PipelineParts,
    SinkError,
};
use crate::audio::sounds::{self, SoundBank};
use crate::audio::wakeword::WakeWordEngine;
use crate::board::{Board, ChatRole, NetworkStatus};
use crate::config::{AppConfig, DeviceConfig, ListeningMode};
use crate::error::Result;
use crate::mcp::{
    DeviceControl, ToolDescriptor, ToolDispatcher, ToolRegistry, register_device_tools,
};
use crate::protocol::{
    ControlMessage, ListenState, MessageKind, Protocol, ProtocolListener, TtsState,
};
use crate::state::{DeviceState, StateMachine, StateReader, StateTransitionEvent, TransitionTable};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde_json::{Value, json};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Work that must run on the core thread.
pub type CoreWork = Box<dyn FnOnce(&mut Application) + Send>;

/// Everything the core reacts to.
pub enum AppEvent {
    StateChanged(StateTransitionEvent),
    WakeWordDetected(String),
    /// The uplink outbox went from empty to non-empty.
    AudioReadyToSend,
    /// `connect()` for session `session` completed.
    NetworkConnected { session: u64 },
    ConnectFailed { session: u64, reason: String },
    /// The server channel dropped without a local close.
    NetworkDisconnected(Option<String>),
    StartListening,
    StopListening,
    InboundControl(ControlMessage),
    /// Board networking came up (or did not).
    NetworkStarted(NetworkStatus),
    Overrun(&'static str),
    Run(CoreWork),
    Shutdown,
}

impl fmt::Debug for AppEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(e) => f.debug_tuple("StateChanged").field(e).finish(),
            Self::WakeWordDetected(k) => f.debug_tuple("WakeWordDetected").field(k).finish(),
            Self::AudioReadyToSend => f.write_str("AudioReadyToSend"),
            Self::NetworkConnected { session } => f
                .debug_struct("NetworkConnected")
                .field("session", session)
                .finish(),
            Self::ConnectFailed { session, reason } => f
                .debug_struct("ConnectFailed")
                .field("session", session)
                .field("reason", reason)
                .finish(),
            Self::NetworkDisconnected(r) => f.debug_tuple("NetworkDisconnected").field(r).finish(),
            Self::StartListening => f.write_str("StartListening"),
            Self::StopListening => f.write_str("StopListening"),
            Self::InboundControl(m) => f.debug_tuple("InboundControl").field(m).finish(),
            Self::NetworkStarted(s) => f.debug_tuple("NetworkStarted").field(s).finish(),
            Self::Overrun(q) => f.debug_tuple("Overrun").field(q).finish(),
            Self::Run(_) => f.write_str("Run(..)"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Thread-safe way into the core. Cheap to clone.
#[derive(Clone)]
pub struct CoreHandle {
    tx: Sender<AppEvent>,
    /// Backlog size that triggers a warning.
    high_water: usize,
}

impl CoreHandle {
    /// Queue an event. Never blocks. Returns `false` once the core is gone.
    pub fn post(&self, event: AppEvent) -> bool {
        let backlog = self.tx.len();
        if backlog == self.high_water {
            warn!("core event backlog reached {backlog}");
        }
        self.tx.send(event).is_ok()
    }

    /// Run `work` on the core thread, after the events already queued.
    pub fn schedule<F>(&self, work: F) -> bool
    where
        F: FnOnce(&mut Application) + Send + 'static,
    {
        self.post(AppEvent::Run(Box::new(work)))
    }

    pub fn start_listening(&self) -> bool {
        self.post(AppEvent::StartListening)
    }

    pub fn stop_listening(&self) -> bool {
        self.post(AppEvent::StopListening)
    }

    /// Ask the loop to exit. `Application::run` then stops the pipeline and
    /// closes the protocol before returning.
    pub fn shutdown(&self) {
        self.post(AppEvent::Shutdown);
    }
}

/// Send-stage sink: parks encoded frames in the core's outbox and wakes the
/// core when the outbox turns non-empty.
struct CoreUplink {
    outbox: Sender<AudioFrame>,
    handle: CoreHandle,
}

impl AudioSink for CoreUplink {
    fn send_audio(&self, frame: AudioFrame) -> std::result::Result<(), SinkError> {
        match self.outbox.try_send(frame) {
            Ok(()) => {
                if self.outbox.len() == 1 {
                    self.handle.post(AppEvent::AudioReadyToSend);
                }
                Ok(())
            }
            Err(TrySendError::Full(frame)) => Err(SinkError::Busy(frame)),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Failed("core stopped".into())),
        }
    }
}

/// Protocol callbacks, run on the transport's thread.
struct CoreListener {
    handle: CoreHandle,
    inbound: InboundHandle,
    state: StateReader,
}

impl ProtocolListener for CoreListener {
    fn on_control(&self, message: ControlMessage) {
        self.handle.post(AppEvent::InboundControl(message));
    }

    fn on_audio(&self, frame: AudioFrame) {
        if self.state.get() != DeviceState::Speaking {
            trace!("dropping downlink audio outside speaking");
            return;
        }
        if !self.inbound.push(frame) {
            trace!("dropping downlink audio, pipeline stopped");
        }
    }

    fn on_channel_closed(&self, reason: Option<String>) {
        self.handle.post(AppEvent::NetworkDisconnected(reason));
    }
}

/// What the built-in tools act on.
struct CoreDevice {
    state: StateReader,
    codec: Arc<dyn AudioCodec>,
    board: Arc<dyn Board>,
    sounds: Vec<String>,
    handle: CoreHandle,
}

impl DeviceControl for CoreDevice {
    fn device_status(&self) -> Value {
        json!({
            "board": self.board.name(),
            "state": self.state.get(),
            "audio_speaker": {"volume": self.codec.output_volume()},
            "network": self.board.network_status(),
        })
    }

    fn set_volume(&self, volume: u8) -> std::result::Result<(), String> {
        self.codec.set_output_volume(volume);
        info!("speaker volume set to {volume}");
        Ok(())
    }

    fn play_sound(&self, name: &str) -> std::result::Result<(), String> {
        if !self.sounds.iter().any(|s| s == name) {
            return Err(format!(
                "unknown sound {name:?}, available: {}",
                self.sounds.join(", ")
            ));
        }
        let name = name.to_owned();
        if self.handle.schedule(move |app| {
            if let Err(e) = app.play_sound(&name) {
                warn!("cannot play {name:?}: {e}");
            }
        }) {
            Ok(())
        } else {
            Err("device core stopped".into())
        }
    }
}

/// Hardware and transport the core is built from.
pub struct AppParts {
    pub codec: Arc<dyn AudioCodec>,
    pub encoder: Box<dyn AudioEncoder>,
    pub decoder: Box<dyn AudioDecoder>,
    pub wake_word: Option<Box<dyn WakeWordEngine>>,
    pub sounds: SoundBank,
    pub protocol: Arc<dyn Protocol>,
    pub board: Arc<dyn Board>,
    /// Board- or feature-specific tools registered next to the built-ins.
    pub tools: Vec<ToolDescriptor>,
}

/// The coordinating core.
pub struct Application {
    config: AppConfig,
    machine: StateMachine,
    pipeline: AudioPipeline,
    protocol: Arc<dyn Protocol>,
    board: Arc<dyn Board>,
    dispatcher: ToolDispatcher,
    events: Receiver<AppEvent>,
    outbox: Receiver<AudioFrame>,
    handle: CoreHandle,
    session: Option<Session>,
    next_session_id: u64,
}

impl Application {
    /// Wire everything together. Nothing runs until [`Application::run`].
    ///
    /// # Errors
    ///
    /// Invalid audio settings, an announced format the codecs do not speak,
    /// or a tool name registered twice.
    pub fn new(config: &DeviceConfig, parts: AppParts) -> Result<Self> {
        config.validate_codec(parts.encoder.format(), parts.decoder.format())?;
        let (tx, events) = crossbeam_channel::unbounded();
        let handle = CoreHandle {
            tx,
            high_water: config.app.event_queue_warn_depth.max(1),
        };

        let (outbox_tx, outbox) =
            crossbeam_channel::bounded(config.audio.send_queue_capacity.max(1));
        let uplink = Arc::new(CoreUplink {
            outbox: outbox_tx,
            handle: handle.clone(),
        });

        let observer_handle = handle.clone();
        let observer: PipelineObserver = Arc::new(move |event: PipelineEvent| {
            let event = match event {
                PipelineEvent::WakeWordDetected(keyword) => AppEvent::WakeWordDetected(keyword),
                PipelineEvent::Overrun { queue } => AppEvent::Overrun(queue),
                PipelineEvent::SendFailed(reason) => {
                    debug!("uplink send failed: {reason}");
                    return;
                }
            };
            observer_handle.post(event);
        });

        let pipeline = AudioPipeline::new(
            &config.audio,
            &config.vad,
            PipelineParts {
                codec: Arc::clone(&parts.codec),
                encoder: parts.encoder,
                decoder: parts.decoder,
                wake_word: parts.wake_word,
                sink: uplink,
                sounds: parts.sounds,
            },
            observer,
        )?;

        let mut machine = StateMachine::new(
            TransitionTable::default().with_upgrade_failure(config.app.upgrade_failure),
        );
        let led_board = Arc::clone(&parts.board);
        machine.add_state_change_listener(move |event| {
            led_board.led().on_state_changed(event.current);
        });
        let state_handle = handle.clone();
        machine.add_state_change_listener(move |event| {
            state_handle.post(AppEvent::StateChanged(*event));
        });

        let device: Arc<dyn DeviceControl> = Arc::new(CoreDevice {
            state: machine.reader(),
            codec: Arc::clone(&parts.codec),
            board: Arc::clone(&parts.board),
            sounds: pipeline.sounds().names(),
            handle: handle.clone(),
        });
        let mut builder = ToolRegistry::builder();
        register_device_tools(&mut builder, &device)?;
        for tool in parts.tools {
            builder.register(tool)?;
        }
        let dispatcher = ToolDispatcher::new(Arc::new(builder.build()));
        info!(tools = dispatcher.registry().len(), "tool registry ready");

        parts.protocol.set_listener(Arc::new(CoreListener {
            handle: handle.clone(),
            inbound: pipeline.inbound_handle(),
            state: machine.reader(),
        }));

        Ok(Self {
            config: config.app.clone(),
            machine,
            pipeline,
            protocol: parts.protocol,
            board: parts.board,
            dispatcher,
            events,
            outbox,
            handle,
            session: None,
            next_session_id: 1,
        })
    }

    #[must_use]
    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.machine.current_state()
    }

    #[must_use]
    pub fn state_reader(&self) -> StateReader {
        self.machine.reader()
    }

    #[must_use]
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.dispatcher.registry()
    }

    #[must_use]
    pub fn pipeline(&self) -> &AudioPipeline {
        &self.pipeline
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Start the pipeline and the board network, then process events until
    /// [`CoreHandle::shutdown`]. The pipeline is stopped and the protocol
    /// closed before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline or the network thread cannot start.
    pub fn run(mut self) -> Result<()> {
        info!("device core starting on board {}", self.board.name());
        self.board.display().set_status(status_text(self.state()));
        let started = self.pipeline.start().and_then(|()| self.start_network());
        if let Err(e) = started {
            error!("device core failed to start: {e}");
            self.teardown();
            return Err(e);
        }

        self.event_loop();
        self.teardown();
        Ok(())
    }

    fn event_loop(&mut self) {
        while let Ok(first) = self.events.recv() {
            if self.dispatch(first).is_break() {
                return;
            }
            while let Ok(event) = self.events.try_recv() {
                if self.dispatch(event).is_break() {
                    return;
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.close_session();
        self.protocol.close();
        self.pipeline.stop();
        info!("device core stopped");
    }

    fn start_network(&self) -> Result<()> {
        let board = Arc::clone(&self.board);
        let handle = self.handle.clone();
        std::thread::Builder::new()
            .name("fae-network".into())
            .spawn(move || {
                let status = board.start_network();
                handle.post(AppEvent::NetworkStarted(status));
            })?;
        Ok(())
    }

    fn dispatch(&mut self, event: AppEvent) -> ControlFlow<()> {
        trace!(?event, "core event");
        match event {
            AppEvent::StateChanged(event) => self.on_state_changed(event),
            AppEvent::WakeWordDetected(keyword) => self.on_wake_word(keyword),
            AppEvent::AudioReadyToSend => self.flush_outbox(),
            AppEvent::NetworkConnected { session } => self.on_connected(session),
            AppEvent::ConnectFailed { session, reason } => self.on_connect_failed(session, &reason),
            AppEvent::NetworkDisconnected(reason) => self.on_disconnected(reason),
            AppEvent::StartListening => self.start_listening(),
            AppEvent::StopListening => self.stop_listening(),
            AppEvent::InboundControl(message) => self.on_control(message),
            AppEvent::NetworkStarted(status) => self.on_network_started(status),
            AppEvent::Overrun(queue) => {
                warn!("{queue} queue overrun, shedding voice processing");
                self.pipeline.enable_voice_processing(false);
            }
            AppEvent::Run(work) => work(self),
            AppEvent::Shutdown => {
                info!("shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Play a sound cue ahead of queued speech.
    ///
    /// # Errors
    ///
    /// Unknown sound or stopped pipeline.
    pub fn play_sound(&self, name: &str) -> Result<()> {
        self.pipeline.play_sound(name)
    }

    // ── State ───────────────────────────────────────────────────────

    fn transition(&mut self, target: DeviceState) -> bool {
        match self.machine.request_transition(target) {
            Ok(()) => true,
            Err(e) => {
                debug!("transition refused: {e}");
                false
            }
        }
    }

    fn listening_mode(&self) -> ListeningMode {
        self.session
            .as_ref()
            .map_or(self.config.listening_mode, Session::mode)
    }

    fn on_state_changed(&mut self, event: StateTransitionEvent) {
        let state = event.current;
        let realtime = self.listening_mode() == ListeningMode::Realtime;
        let (voice, wake_word) = match state {
            DeviceState::Idle => (false, true),
            DeviceState::Listening => (true, realtime),
            DeviceState::Speaking => (realtime, true),
            _ => (false, false),
        };
        self.pipeline.enable_voice_processing(voice);
        self.pipeline.enable_wake_word_detection(wake_word);

        let display = self.board.display();
        display.set_status(status_text(state));
        if state == DeviceState::Idle {
            display.set_emotion("neutral");
        }

        let due = self
            .session
            .as_mut()
            .map(|s| s.take_pending(state))
            .unwrap_or_default();
        for action in due {
            match action {
                PendingAction::PlaySound(name) => {
                    if let Err(e) = self.play_sound(&name) {
                        warn!("cannot play {name:?}: {e}");
                    }
                }
                PendingAction::SendControl(message) => self.send_control(&message),
            }
        }
    }

    fn on_network_started(&mut self, status: NetworkStatus) {
        info!("network: {status:?}");
        match status {
            NetworkStatus::Connected => {
                if self.transition(DeviceState::Activating) {
                    self.transition(DeviceState::Idle);
                }
            }
            NetworkStatus::NeedsProvisioning => {
                self.transition(DeviceState::WifiConfiguring);
            }
            NetworkStatus::Offline => {
                self.board
                    .display()
                    .show_alert("Offline", "network unavailable", Some("sad"));
                self.transition(DeviceState::WifiConfiguring);
            }
        }
    }

    // ── Listening turns ─────────────────────────────────────────────

    fn on_wake_word(&mut self, keyword: String) {
        let state = self.state();
        info!("wake word {keyword:?} in {state}");
        match state {
            DeviceState::Idle => self.open_session(self.config.listening_mode, Some(keyword)),
            DeviceState::Speaking => self.interrupt_speaking(Some("wake_word_detected")),
            _ => debug!("wake word ignored in {state}"),
        }
    }

    fn start_listening(&mut self) {
        let state = self.state();
        match state {
            DeviceState::Idle => self.open_session(ListeningMode::ManualStop, None),
            DeviceState::Speaking => {
                if let Some(session) = self.session.as_mut() {
                    session.set_mode(ListeningMode::ManualStop);
                }
                self.interrupt_speaking(None);
            }
            _ => debug!("start listening ignored in {state}"),
        }
    }

    fn stop_listening(&mut self) {
        if self.state() == DeviceState::Listening {
            self.send_control(&ControlMessage::listen(ListenState::Stop, None, None));
            self.transition(DeviceState::Idle);
        }
    }

    fn interrupt_speaking(&mut self, reason: Option<&str>) {
        info!("interrupting speech");
        self.send_control(&ControlMessage::abort(reason));
        self.pipeline.reset_playback();
        self.send_listen_start();
        self.transition(DeviceState::Listening);
    }

    fn send_listen_start(&self) {
        let mode = self.listening_mode();
        self.send_control(&ControlMessage::listen(
            ListenState::Start,
            Some(mode.as_wire()),
            None,
        ));
    }

    /// Start a listening turn, reusing an open session when there is one.
    fn open_session(&mut self, mode: ListeningMode, wake_word: Option<String>) {
        let reusable = self.protocol.is_connected()
            && self.session.as_ref().is_some_and(Session::is_connected);
        if reusable && let Some(session) = self.session.as_mut() {
            session.set_mode(mode);
            session.set_wake_word(wake_word);
            session.defer(
                DeviceState::Listening,
                PendingAction::PlaySound(sounds::POPUP.into()),
            );
            self.begin_listening();
            return;
        }

        self.close_session();
        let id = self.next_session_id;
        self.next_session_id += 1;
        let mut session = Session::new(id, mode, wake_word);
        session.defer(
            DeviceState::Listening,
            PendingAction::PlaySound(sounds::POPUP.into()),
        );
        session.record_attempt();
        self.session = Some(session);

        if !self.transition(DeviceState::Connecting) {
            self.session = None;
            return;
        }
        info!("opening session {id} ({})", mode.as_wire());
        self.spawn_connect(id);
    }

    fn spawn_connect(&self, session: u64) {
        let protocol = Arc::clone(&self.protocol);
        let handle = self.handle.clone();
        let spawned = std::thread::Builder::new()
            .name("fae-connect".into())
            .spawn(move || {
                let event = match protocol.connect() {
                    Ok(()) => AppEvent::NetworkConnected { session },
                    Err(e) => AppEvent::ConnectFailed {
                        session,
                        reason: e.to_string(),
                    },
                };
                handle.post(event);
            });
        if let Err(e) = spawned {
            self.handle.post(AppEvent::ConnectFailed {
                session,
                reason: format!("cannot spawn connect thread: {e}"),
            });
        }
    }

    fn on_connected(&mut self, id: u64) {
        if self.state() != DeviceState::Connecting {
            debug!("late connect for session {id} ignored");
            return;
        }
        let Some(session) = self.session.as_mut().filter(|s| s.id() == id) else {
            debug!("stale connect for session {id} ignored");
            return;
        };
        session.mark_connected();
        info!(
            "session {id} connected via {}, server session {:?}",
            self.protocol.name(),
            self.protocol.session_id()
        );
        self.begin_listening();
    }

    fn begin_listening(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let keyword = session.take_wake_word();
        if let Some(keyword) = keyword {
            self.send_control(&ControlMessage::listen(
                ListenState::Detect,
                None,
                Some(&keyword),
            ));
        }
        self.send_listen_start();
        self.pipeline.reset_playback();
        self.transition(DeviceState::Listening);
    }

    fn on_connect_failed(&mut self, id: u64, reason: &str) {
        if self.state() != DeviceState::Connecting {
            return;
        }
        let max = self.config.max_connect_retries;
        let Some(session) = self.session.as_mut().filter(|s| s.id() == id) else {
            debug!("stale connect failure for session {id} ignored");
            return;
        };
        let attempts = session.connect_attempts();
        if attempts <= max {
            session.record_attempt();
            warn!("connect failed ({reason}), retry {attempts}/{max}");
            self.spawn_connect(id);
        } else {
            self.fail_session("Connection failed", reason);
        }
    }

    fn on_disconnected(&mut self, reason: Option<String>) {
        if self.session.is_none() {
            debug!("channel closed with no session");
            return;
        }
        let reason = reason.unwrap_or_else(|| "connection closed".to_owned());
        if self.state() == DeviceState::Idle {
            info!("idle session closed: {reason}");
            self.close_session();
        } else {
            self.fail_session("Disconnected", &reason);
        }
    }

    /// Tear the session down after an error, tell the user, go idle.
    fn fail_session(&mut self, status: &str, reason: &str) {
        warn!("{status}: {reason}");
        self.close_session();
        if self.state() != DeviceState::Idle {
            self.transition(DeviceState::Idle);
        }
        self.board.display().show_alert(status, reason, Some("sad"));
        if let Err(e) = self.play_sound(sounds::EXCLAMATION) {
            debug!("no alert cue: {e}");
        }
    }

    fn close_session(&mut self) {
        // Reset first: it releases a receive thread stalled on a full
        // decode queue, which `close` joins.
        self.pipeline.reset_playback();
        if let Some(session) = self.session.take() {
            info!("closing session {}", session.id());
            self.protocol.close();
        }
        let dropped = self.outbox.try_iter().count();
        if dropped > 0 {
            debug!("{dropped} uplink frames dropped");
        }
    }

    fn flush_outbox(&mut self) {
        for frame in self.outbox.try_iter() {
            if let Err(e) = self.protocol.send_audio(frame) {
                debug!("uplink frame dropped: {e}");
            }
        }
    }

    fn send_control(&self, message: &ControlMessage) {
        if let Err(e) = self.protocol.send_control(message) {
            warn!("cannot send {}: {e}", message.wire_type());
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    fn on_control(&mut self, message: ControlMessage) {
        let kind = message.kind();
        let state = self.state();
        match message {
            ControlMessage::Tts {
                state: TtsState::Start,
                ..
            } => {
                if matches!(state, DeviceState::Idle | DeviceState::Listening) {
                    self.transition(DeviceState::Speaking);
                }
            }
            ControlMessage::Tts {
                state: TtsState::Stop,
                ..
            } => {
                if state == DeviceState::Speaking {
                    if self.listening_mode() == ListeningMode::ManualStop {
                        self.transition(DeviceState::Idle);
                    } else {
                        self.send_listen_start();
                        self.transition(DeviceState::Listening);
                    }
                }
            }
            ControlMessage::Tts {
                state: TtsState::SentenceStart,
                text,
            } => {
                if let Some(text) = text {
                    self.board
                        .display()
                        .set_chat_message(ChatRole::Assistant, &text);
                }
            }
            ControlMessage::Stt { text } => {
                info!(">> {text}");
                self.board.display().set_chat_message(ChatRole::User, &text);
            }
            ControlMessage::Llm { emotion, .. } => {
                if let Some(emotion) = emotion {
                    self.board.display().set_emotion(&emotion);
                }
            }
            ControlMessage::Alert {
                status,
                message,
                emotion,
            } => {
                self.board
                    .display()
                    .show_alert(&status, &message, emotion.as_deref());
                if let Err(e) = self.play_sound(sounds::EXCLAMATION) {
                    debug!("no alert cue: {e}");
                }
            }
            ControlMessage::System { command } => {
                if command == "reboot" {
                    info!("server requested reboot");
                    self.board.reboot();
                } else {
                    debug!("unknown system command {command:?}");
                }
            }
            ControlMessage::Goodbye => {
                info!("server said goodbye");
                self.close_session();
                if state != DeviceState::Idle {
                    self.transition(DeviceState::Idle);
                }
            }
            ControlMessage::Mcp { payload } if kind == MessageKind::McpToolCall => {
                self.on_tool_call(payload);
            }
            other => debug!("ignoring inbound {}", other.wire_type()),
        }
    }

    fn on_tool_call(&self, payload: Value) {
        let protocol = Arc::clone(&self.protocol);
        let dispatched = self.dispatcher.dispatch(payload, move |reply| {
            if let Err(e) = protocol.send_control(&reply) {
                warn!("tool reply not sent: {e}");
            }
        });
        if let Err(e) = dispatched {
            error!("cannot dispatch tool call: {e}");
        }
    }
}

fn status_text(state: DeviceState) -> &'static str {
    match state {
        DeviceState::Starting => "Starting",
        DeviceState::Activating => "Activating",
        DeviceState::Idle => "Standby",
        DeviceState::Connecting => "Connecting",
        DeviceState::Listening => "Listening",
        DeviceState::Speaking => "Speaking",
        DeviceState::WifiConfiguring => "Wi-Fi setup",
        DeviceState::Upgrading => "Upgrading",
    }
}
