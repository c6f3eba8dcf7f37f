//! The audio pipeline: capture → VAD/wake word → encode → send, and
//! inbound → decode → playback.
//!
//! Each stage is a named OS thread. Stages hand frames to each other through
//! bounded [`queue`](crate::audio::queue)s, so a slow consumer stalls its
//! producer instead of losing audio. Short sound cues bypass the decode path
//! through a separate priority lane checked by the playback stage before
//! every conversational frame.

use crate::audio::codec::{AudioCodec, AudioDecoder, AudioEncoder, resample_linear};
use crate::audio::frame::{AudioFrame, FrameData};
use crate::audio::queue::{
    POLL_INTERVAL, Popped, QueueReceiver, QueueSender, ShutdownFlag, frame_queue,
};
use crate::audio::sounds::SoundBank;
use crate::audio::vad::EnergyVad;
use crate::audio::wakeword::WakeWordEngine;
use crate::config::{AudioConfig, VadConfig};
use crate::error::{DeviceError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Something the pipeline wants the application core to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    WakeWordDetected(String),
    /// A producer stalled on a full queue longer than the overrun threshold.
    Overrun { queue: &'static str },
    /// The uplink rejected a frame.
    SendFailed(String),
}

/// Callback invoked from worker threads. Must not block.
pub type PipelineObserver = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Observer that ignores everything.
#[must_use]
pub fn noop_observer() -> PipelineObserver {
    Arc::new(|_| {})
}

/// Why the uplink did not take a frame.
#[derive(Debug)]
pub enum SinkError {
    /// Try again later; the frame is handed back untouched.
    Busy(AudioFrame),
    Failed(String),
}

/// Where the send stage delivers encoded frames.
pub trait AudioSink: Send + Sync {
    /// # Errors
    ///
    /// [`SinkError::Busy`] applies backpressure; [`SinkError::Failed`] is
    /// reported as [`PipelineEvent::SendFailed`] and the frame is dropped.
    fn send_audio(&self, frame: AudioFrame) -> std::result::Result<(), SinkError>;
}

/// Everything the pipeline takes ownership of.
pub struct PipelineParts {
    pub codec: Arc<dyn AudioCodec>,
    pub encoder: Box<dyn AudioEncoder>,
    pub decoder: Box<dyn AudioDecoder>,
    pub wake_word: Option<Box<dyn WakeWordEngine>>,
    pub sink: Arc<dyn AudioSink>,
    pub sounds: SoundBank,
}

/// State visible to every worker.
struct Shared {
    shutdown: ShutdownFlag,
    voice_processing: AtomicBool,
    wake_word_enabled: AtomicBool,
    voice_detected: Arc<AtomicBool>,
    /// Bumped by `reset_playback`; frames popped under an older value are dropped.
    playback_generation: AtomicU64,
    active_workers: AtomicUsize,
    observer: PipelineObserver,
}

impl Shared {
    fn emit(&self, event: PipelineEvent) {
        (self.observer)(event);
    }
}

/// Decrements the live-worker count however the worker exits.
struct WorkerGuard(Arc<Shared>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Queues {
    encode_tx: QueueSender,
    encode_rx: QueueReceiver,
    send_tx: QueueSender,
    send_rx: QueueReceiver,
    decode_tx: QueueSender,
    decode_rx: QueueReceiver,
    playback_tx: QueueSender,
    playback_rx: QueueReceiver,
    sound_tx: Sender<Arc<[i16]>>,
    sound_rx: Receiver<Arc<[i16]>>,
}

impl Queues {
    fn new(config: &AudioConfig, shutdown: &ShutdownFlag) -> Self {
        let threshold = Duration::from_millis(config.overrun_threshold_ms);
        let (encode_tx, encode_rx) =
            frame_queue("encode", config.encode_queue_capacity, shutdown, threshold);
        let (send_tx, send_rx) = frame_queue("send", config.send_queue_capacity, shutdown, threshold);
        let (decode_tx, decode_rx) =
            frame_queue("decode", config.decode_queue_capacity, shutdown, threshold);
        let (playback_tx, playback_rx) =
            frame_queue("playback", config.playback_queue_capacity, shutdown, threshold);
        let (sound_tx, sound_rx) = crossbeam_channel::unbounded();
        Self {
            encode_tx,
            encode_rx,
            send_tx,
            send_rx,
            decode_tx,
            decode_rx,
            playback_tx,
            playback_rx,
            sound_tx,
            sound_rx,
        }
    }

    fn clear(&self) -> usize {
        self.encode_rx.clear()
            + self.send_rx.clear()
            + self.decode_rx.clear()
            + self.playback_rx.clear()
            + self.sound_rx.try_iter().count()
    }
}

/// Entry point for audio arriving from the server.
///
/// Cloneable and cheap; the protocol receive thread holds one.
#[derive(Clone)]
pub struct InboundHandle {
    tx: QueueSender,
    shared: Arc<Shared>,
}

impl InboundHandle {
    /// Queue a frame for decoding, blocking while the decode queue is full.
    ///
    /// This stalls the calling receive thread. A [`AudioPipeline::reset_playback`]
    /// during the wait releases it and the frame is discarded with the rest
    /// of the old reply.
    ///
    /// Returns `false` if the frame was not queued: the pipeline is stopped
    /// or playback was reset meanwhile.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let generation = self.shared.playback_generation.load(Ordering::Acquire);
        self.tx
            .push_until(
                frame,
                |_| {
                    self.shared.emit(PipelineEvent::Overrun { queue: "decode" });
                },
                || self.shared.playback_generation.load(Ordering::Acquire) != generation,
            )
            .unwrap_or(false)
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The running audio pipeline.
pub struct AudioPipeline {
    config: AudioConfig,
    codec: Arc<dyn AudioCodec>,
    encoder: Arc<Mutex<Box<dyn AudioEncoder>>>,
    decoder: Arc<Mutex<Box<dyn AudioDecoder>>>,
    wake_word: Arc<Mutex<Option<Box<dyn WakeWordEngine>>>>,
    vad: Arc<Mutex<EnergyVad>>,
    sink: Arc<dyn AudioSink>,
    sounds: SoundBank,
    shared: Arc<Shared>,
    queues: Queues,
    workers: Vec<JoinHandle<()>>,
}

impl AudioPipeline {
    /// Build a stopped pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Config`] for a zero frame duration.
    pub fn new(
        config: &AudioConfig,
        vad_config: &VadConfig,
        parts: PipelineParts,
        observer: PipelineObserver,
    ) -> Result<Self> {
        if config.frame_duration_ms == 0 {
            return Err(DeviceError::Config("frame_duration_ms must be > 0".into()));
        }

        let vad = EnergyVad::new(vad_config);
        let shutdown = ShutdownFlag::new();
        // Stopped until `start`; inbound pushes fail fast meanwhile.
        shutdown.trigger();

        let shared = Arc::new(Shared {
            shutdown: shutdown.clone(),
            voice_processing: AtomicBool::new(false),
            wake_word_enabled: AtomicBool::new(false),
            voice_detected: vad.detected_flag(),
            playback_generation: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            observer,
        });

        Ok(Self {
            queues: Queues::new(config, &shutdown),
            config: config.clone(),
            codec: parts.codec,
            encoder: Arc::new(Mutex::new(parts.encoder)),
            decoder: Arc::new(Mutex::new(parts.decoder)),
            wake_word: Arc::new(Mutex::new(parts.wake_word)),
            vad: Arc::new(Mutex::new(vad)),
            sink: parts.sink,
            sounds: parts.sounds,
            shared,
            workers: Vec::new(),
        })
    }

    /// Spawn the five stage workers. No-op if already running.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned; any workers
    /// already started are stopped again.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.shared.shutdown.clear();
        self.codec.enable_input(true);

        if let Err(e) = self.spawn_workers() {
            error!("audio pipeline failed to start: {e}");
            self.stop();
            return Err(e);
        }

        info!(
            "audio pipeline started: {}Hz in, {}Hz out, {}ms frames",
            self.codec.input_sample_rate(),
            self.codec.output_sample_rate(),
            self.config.frame_duration_ms
        );
        Ok(())
    }

    fn spawn_workers(&mut self) -> Result<()> {
        let capture = CaptureStage {
            shared: Arc::clone(&self.shared),
            codec: Arc::clone(&self.codec),
            vad: Arc::clone(&self.vad),
            wake_word: Arc::clone(&self.wake_word),
            encode_tx: self.queues.encode_tx.clone(),
            frame_samples: self.config.input_frame_samples(),
            frame_ms: self.config.frame_duration_ms,
        };
        self.spawn("fae-capture", move || capture.run())?;

        let shared = Arc::clone(&self.shared);
        let encoder = Arc::clone(&self.encoder);
        let (encode_rx, send_tx) = (self.queues.encode_rx.clone(), self.queues.send_tx.clone());
        self.spawn("fae-encode", move || {
            run_encode(&shared, &encoder, &encode_rx, &send_tx);
        })?;

        let shared = Arc::clone(&self.shared);
        let sink = Arc::clone(&self.sink);
        let send_rx = self.queues.send_rx.clone();
        let threshold = Duration::from_millis(self.config.overrun_threshold_ms);
        self.spawn("fae-send", move || {
            run_send(&shared, sink.as_ref(), &send_rx, threshold);
        })?;

        let shared = Arc::clone(&self.shared);
        let decoder = Arc::clone(&self.decoder);
        let out_rate = self.codec.output_sample_rate();
        let (decode_rx, playback_tx) = (
            self.queues.decode_rx.clone(),
            self.queues.playback_tx.clone(),
        );
        self.spawn("fae-decode", move || {
            run_decode(&shared, &decoder, &decode_rx, &playback_tx, out_rate);
        })?;

        let playback = PlaybackStage {
            shared: Arc::clone(&self.shared),
            codec: Arc::clone(&self.codec),
            playback_rx: self.queues.playback_rx.clone(),
            sound_rx: self.queues.sound_rx.clone(),
            frame_samples: self.config.output_frame_samples().max(1),
            idle_timeout: Duration::from_millis(self.config.output_idle_timeout_ms),
            output_on: false,
            last_write: Instant::now(),
        };
        self.spawn("fae-playback", move || playback.run())?;

        Ok(())
    }

    fn spawn<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        let guard_shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _guard = WorkerGuard(guard_shared);
                debug!("audio worker started");
                body();
                debug!("audio worker exiting");
            });
        match spawned {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
                Err(DeviceError::Pipeline(format!("cannot spawn {name}: {e}")))
            }
        }
    }

    /// Stop every worker, discard queued audio and power the codec down.
    ///
    /// Idempotent. Returns once no worker is left running.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.trigger();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("audio worker panicked");
            }
        }
        let discarded = self.queues.clear();
        self.codec.enable_input(false);
        self.codec.enable_output(false);
        lock(&self.vad).reset();
        info!("audio pipeline stopped, {discarded} queued items discarded");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Worker threads currently alive.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// Route captured frames to the encoder (on) or discard them (off).
    pub fn enable_voice_processing(&self, enabled: bool) {
        if self.shared.voice_processing.swap(enabled, Ordering::AcqRel) != enabled {
            debug!("voice processing {}", if enabled { "on" } else { "off" });
        }
    }

    pub fn enable_wake_word_detection(&self, enabled: bool) {
        if self.shared.wake_word_enabled.swap(enabled, Ordering::AcqRel) != enabled {
            debug!("wake word detection {}", if enabled { "on" } else { "off" });
        }
    }

    #[must_use]
    pub fn is_voice_processing(&self) -> bool {
        self.shared.voice_processing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_wake_word_detection(&self) -> bool {
        self.shared.wake_word_enabled.load(Ordering::Acquire)
    }

    /// Latest VAD decision.
    #[must_use]
    pub fn is_voice_detected(&self) -> bool {
        self.shared.voice_detected.load(Ordering::Acquire)
    }

    /// Play a short clip ahead of any queued conversational audio.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Audio`] for unknown sounds and
    /// [`DeviceError::Pipeline`] when the pipeline is not running.
    pub fn play_sound(&self, name: &str) -> Result<()> {
        if !self.is_running() {
            return Err(DeviceError::Pipeline(format!(
                "cannot play {name:?}: pipeline not running"
            )));
        }
        let clip = self.sounds.get(name)?;
        let out_rate = self.codec.output_sample_rate();
        let clip = if self.sounds.sample_rate() == out_rate {
            clip
        } else {
            Arc::from(resample_linear(&clip, self.sounds.sample_rate(), out_rate))
        };
        self.queues
            .sound_tx
            .send(clip)
            .map_err(|e| DeviceError::Channel(format!("sound lane closed: {e}")))?;
        debug!("queued sound {name:?}");
        Ok(())
    }

    /// Discard pending downlink audio and reset the decoder.
    pub fn reset_playback(&self) {
        self.shared.playback_generation.fetch_add(1, Ordering::AcqRel);
        let dropped = self.queues.decode_rx.clear() + self.queues.playback_rx.clear();
        if dropped > 0 {
            debug!("playback reset, {dropped} frames dropped");
        }
    }

    /// Handle the protocol uses to feed downlink audio.
    #[must_use]
    pub fn inbound_handle(&self) -> InboundHandle {
        InboundHandle {
            tx: self.queues.decode_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn sounds(&self) -> &SoundBank {
        &self.sounds
    }

    #[must_use]
    pub fn codec(&self) -> &Arc<dyn AudioCodec> {
        &self.codec
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Stages ──────────────────────────────────────────────────────────

struct CaptureStage {
    shared: Arc<Shared>,
    codec: Arc<dyn AudioCodec>,
    vad: Arc<Mutex<EnergyVad>>,
    wake_word: Arc<Mutex<Option<Box<dyn WakeWordEngine>>>>,
    encode_tx: QueueSender,
    frame_samples: usize,
    frame_ms: u32,
}

impl CaptureStage {
    fn run(self) {
        let rate = self.codec.input_sample_rate();
        let mut vad = lock(&self.vad);
        let mut wake_word = lock(&self.wake_word);
        let mut wake_was_enabled = false;
        let mut index: u32 = 0;

        while !self.shared.shutdown.is_triggered() {
            let pcm = match self.codec.read_frame(self.frame_samples) {
                Ok(pcm) => pcm,
                Err(e) => {
                    warn!("capture read failed, substituting silence: {e}");
                    std::thread::sleep(Duration::from_millis(u64::from(self.frame_ms)));
                    vec![0; self.frame_samples]
                }
            };
            let timestamp = index.wrapping_mul(self.frame_ms);
            index = index.wrapping_add(1);

            vad.process(&pcm);

            let wake_enabled = self.shared.wake_word_enabled.load(Ordering::Acquire);
            if let (true, Some(engine)) = (wake_enabled, wake_word.as_mut()) {
                if !wake_was_enabled {
                    engine.reset();
                }
                if let Some(keyword) = engine.feed(&pcm) {
                    info!("wake word detected: {keyword}");
                    self.shared.emit(PipelineEvent::WakeWordDetected(keyword));
                }
            }
            wake_was_enabled = wake_enabled;

            if self.shared.voice_processing.load(Ordering::Acquire) {
                let frame = AudioFrame::pcm(pcm, rate, timestamp);
                let pushed = self.encode_tx.push_with(frame, |_| {
                    self.shared.emit(PipelineEvent::Overrun { queue: "encode" });
                });
                if pushed.is_err() {
                    break;
                }
            }
        }
    }
}

fn run_encode(
    shared: &Shared,
    encoder: &Mutex<Box<dyn AudioEncoder>>,
    encode_rx: &QueueReceiver,
    send_tx: &QueueSender,
) {
    let mut encoder = lock(encoder);
    while let Some(frame) = encode_rx.pop() {
        let Some(pcm) = frame.samples() else {
            continue;
        };
        let payload = match encoder.encode(pcm) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("encode failed, frame dropped: {e}");
                continue;
            }
        };
        let out = AudioFrame::encoded(payload, frame.sample_rate, frame.timestamp);
        let pushed = send_tx.push_with(out, |_| {
            shared.emit(PipelineEvent::Overrun { queue: "send" });
        });
        if pushed.is_err() {
            break;
        }
    }
}

fn run_send(shared: &Shared, sink: &dyn AudioSink, send_rx: &QueueReceiver, threshold: Duration) {
    let mut failing = false;
    while let Some(frame) = send_rx.pop() {
        let started = Instant::now();
        let mut reported = false;
        let mut pending = frame;
        loop {
            match sink.send_audio(pending) {
                Ok(()) => {
                    failing = false;
                    break;
                }
                Err(SinkError::Busy(frame)) => {
                    if shared.shutdown.is_triggered() {
                        return;
                    }
                    if !reported && started.elapsed() >= threshold {
                        reported = true;
                        warn!("uplink busy for {}ms", started.elapsed().as_millis());
                        shared.emit(PipelineEvent::Overrun { queue: "uplink" });
                    }
                    pending = frame;
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(SinkError::Failed(reason)) => {
                    // One report per failure streak.
                    if !failing {
                        warn!("audio send failed: {reason}");
                        shared.emit(PipelineEvent::SendFailed(reason));
                    }
                    failing = true;
                    break;
                }
            }
        }
    }
}

fn run_decode(
    shared: &Shared,
    decoder: &Mutex<Box<dyn AudioDecoder>>,
    decode_rx: &QueueReceiver,
    playback_tx: &QueueSender,
    out_rate: u32,
) {
    let mut decoder = lock(decoder);
    decoder.reset();
    let mut seen_generation = shared.playback_generation.load(Ordering::Acquire);

    while let Some(frame) = decode_rx.pop() {
        // Read after the pop: a reset while idle must not mark the next
        // frame stale.
        let generation = shared.playback_generation.load(Ordering::Acquire);
        if generation != seen_generation {
            decoder.reset();
            seen_generation = generation;
        }

        let pcm = match &frame.data {
            FrameData::Pcm(samples) => samples.clone(),
            FrameData::Encoded(bytes) => match decoder.decode(bytes) {
                Ok(pcm) => pcm,
                Err(e) => {
                    warn!("decode failed, frame dropped: {e}");
                    continue;
                }
            },
        };
        let pcm = resample_linear(&pcm, frame.sample_rate, out_rate);

        let stale = || shared.playback_generation.load(Ordering::Acquire) != generation;
        if stale() {
            continue;
        }
        let pushed = playback_tx.push_until(
            AudioFrame::pcm(pcm, out_rate, frame.timestamp),
            |_| {},
            stale,
        );
        if pushed.is_err() {
            break;
        }
    }
}

struct PlaybackStage {
    shared: Arc<Shared>,
    codec: Arc<dyn AudioCodec>,
    playback_rx: QueueReceiver,
    sound_rx: Receiver<Arc<[i16]>>,
    frame_samples: usize,
    idle_timeout: Duration,
    output_on: bool,
    last_write: Instant,
}

impl PlaybackStage {
    fn run(mut self) {
        while !self.shared.shutdown.is_triggered() {
            if let Ok(clip) = self.sound_rx.try_recv() {
                self.play_clip(&clip);
                continue;
            }

            match self.playback_rx.pop_timeout(POLL_INTERVAL) {
                Popped::Frame(frame) => {
                    let generation = self.shared.playback_generation.load(Ordering::Acquire);
                    // Cues queued meanwhile go first.
                    while let Ok(clip) = self.sound_rx.try_recv() {
                        self.play_clip(&clip);
                    }
                    if self.shared.playback_generation.load(Ordering::Acquire) != generation {
                        continue;
                    }
                    if let Some(pcm) = frame.samples() {
                        self.write(pcm);
                    }
                }
                Popped::TimedOut => {
                    if self.output_on && self.last_write.elapsed() >= self.idle_timeout {
                        debug!("speaker idle, amplifier off");
                        self.codec.enable_output(false);
                        self.output_on = false;
                    }
                }
                Popped::Closed(_) => break,
            }
        }
    }

    fn play_clip(&mut self, clip: &[i16]) {
        for chunk in clip.chunks(self.frame_samples) {
            if self.shared.shutdown.is_triggered() {
                return;
            }
            self.write(chunk);
        }
    }

    fn write(&mut self, pcm: &[i16]) {
        if !self.output_on {
            self.codec.enable_output(true);
            self.output_on = true;
        }
        if let Err(e) = self.codec.write_frame(pcm) {
            warn!("playback write failed: {e}");
        }
        self.last_write = Instant::now();
    }
}
