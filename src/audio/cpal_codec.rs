//! Host audio codec on cpal, for running the device core on a desktop.
//!
//! cpal streams are not `Send` on every platform, so both streams are built
//! and kept alive on a dedicated thread. The codec itself only touches two
//! shared sample buffers that the stream callbacks fill and drain.

use crate::audio::codec::{AudioCodec, resample_linear};
use crate::config::AudioConfig;
use crate::error::{DeviceError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Default)]
struct SampleBuffer {
    samples: Mutex<VecDeque<i16>>,
    changed: Condvar,
}

impl SampleBuffer {
    fn lock(&self) -> MutexGuard<'_, VecDeque<i16>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared with the stream callbacks.
struct Shared {
    capture: SampleBuffer,
    playback: SampleBuffer,
    input_on: AtomicBool,
    output_on: AtomicBool,
    volume: AtomicU8,
    stop: AtomicBool,
}

/// [`AudioCodec`] backed by the host's default (or named) sound devices.
pub struct CpalCodec {
    input_rate: u32,
    output_rate: u32,
    native_output_rate: u32,
    /// Longest `read_frame` waits before giving up.
    read_timeout: Duration,
    /// Playback backlog (native samples) above which `write_frame` blocks.
    max_backlog: usize,
    shared: Arc<Shared>,
    stream_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalCodec {
    /// Open input and output devices and start both streams.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Audio`] if a device is missing or a stream
    /// cannot be built.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            capture: SampleBuffer::default(),
            playback: SampleBuffer::default(),
            input_on: AtomicBool::new(false),
            output_on: AtomicBool::new(false),
            volume: AtomicU8::new(70),
            stop: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
        let thread_shared = Arc::clone(&shared);
        let thread_config = config.clone();
        let handle = std::thread::Builder::new()
            .name("fae-cpal".to_owned())
            .spawn(move || run_streams(&thread_config, &thread_shared, &ready_tx))
            .map_err(|e| DeviceError::Audio(format!("cannot spawn audio thread: {e}")))?;

        let native_output_rate = ready_rx
            .recv()
            .map_err(|_| DeviceError::Audio("audio thread exited during setup".into()))??;

        Ok(Self {
            input_rate: config.input_sample_rate,
            output_rate: config.output_sample_rate,
            native_output_rate,
            read_timeout: Duration::from_millis(u64::from(config.frame_duration_ms) * 4),
            max_backlog: native_output_rate as usize / 5,
            shared,
            stream_thread: Mutex::new(Some(handle)),
        })
    }

    /// Names of the host's input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| DeviceError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }

    /// Names of the host's output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .output_devices()
            .map_err(|e| DeviceError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

impl Drop for CpalCodec {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        let handle = self
            .stream_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("audio stream thread panicked");
            }
        }
    }
}

impl AudioCodec for CpalCodec {
    fn input_sample_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn read_frame(&self, samples: usize) -> Result<Vec<i16>> {
        let buffer = &self.shared.capture;
        let guard = buffer.lock();
        let (mut guard, timeout) = buffer
            .changed
            .wait_timeout_while(guard, self.read_timeout, |s| s.len() < samples)
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() && guard.len() < samples {
            return Err(DeviceError::Audio("capture timed out".into()));
        }
        Ok(guard.drain(..samples).collect())
    }

    fn write_frame(&self, pcm: &[i16]) -> Result<()> {
        let native = resample_linear(pcm, self.output_rate, self.native_output_rate);
        let buffer = &self.shared.playback;
        let guard = buffer.lock();
        let (mut guard, _) = buffer
            .changed
            .wait_timeout_while(guard, Duration::from_secs(1), |s| {
                s.len() > self.max_backlog && !self.shared.stop.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.extend(native);
        Ok(())
    }

    fn enable_input(&self, enabled: bool) {
        self.shared.input_on.store(enabled, Ordering::Release);
        if !enabled {
            self.shared.capture.lock().clear();
        }
    }

    fn enable_output(&self, enabled: bool) {
        self.shared.output_on.store(enabled, Ordering::Release);
        if !enabled {
            self.shared.playback.lock().clear();
            self.shared.playback.changed.notify_all();
        }
    }

    fn output_volume(&self) -> u8 {
        self.shared.volume.load(Ordering::Acquire)
    }

    fn set_output_volume(&self, volume: u8) {
        self.shared.volume.store(volume.min(100), Ordering::Release);
    }
}

fn find_device(
    host: &cpal::Host,
    name: Option<&str>,
    input: bool,
) -> Result<cpal::Device> {
    let Some(name) = name else {
        let default = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return default.ok_or_else(|| DeviceError::Audio("no default audio device".into()));
    };
    let mut devices = if input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| DeviceError::Audio(format!("cannot enumerate devices: {e}")))?;
    devices
        .find(|d| {
            d.description()
                .ok()
                .is_some_and(|desc| desc.name() == name)
        })
        .ok_or_else(|| DeviceError::Audio(format!("audio device '{name}' not found")))
}

/// Body of the stream thread: build both streams, report the output rate,
/// then hold the streams until the codec is dropped.
fn run_streams(
    config: &AudioConfig,
    shared: &Arc<Shared>,
    ready: &crossbeam_channel::Sender<Result<u32>>,
) {
    let streams = build_streams(config, shared);
    let (input, output, native_output_rate) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(native_output_rate));

    while !shared.stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(input);
    drop(output);
    debug!("cpal streams closed");
}

fn build_streams(
    config: &AudioConfig,
    shared: &Arc<Shared>,
) -> Result<(cpal::Stream, cpal::Stream, u32)> {
    let host = cpal::default_host();

    let input_device = find_device(&host, config.input_device.as_deref(), true)?;
    let input_default = input_device
        .default_input_config()
        .map_err(|e| DeviceError::Audio(format!("no default input config: {e}")))?;
    let input_config = StreamConfig {
        channels: input_default.channels(),
        sample_rate: input_default.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let output_device = find_device(&host, config.output_device.as_deref(), false)?;
    let output_default = output_device
        .default_output_config()
        .map_err(|e| DeviceError::Audio(format!("no default output config: {e}")))?;
    let output_config = StreamConfig {
        channels: output_default.channels(),
        sample_rate: output_default.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let in_channels = usize::from(input_config.channels.max(1));
    let in_rate = input_config.sample_rate;
    let target_rate = config.input_sample_rate;
    // About two seconds of backlog before the oldest samples are dropped.
    let capture_limit = target_rate as usize * 2;
    let capture_shared = Arc::clone(shared);

    let input = input_device
        .build_input_stream(
            &input_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if !capture_shared.input_on.load(Ordering::Acquire) {
                    return;
                }
                let mono: Vec<i16> = data
                    .chunks_exact(in_channels)
                    .map(|frame| {
                        let v = frame.iter().sum::<f32>() / in_channels as f32;
                        (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
                    })
                    .collect();
                let samples = resample_linear(&mono, in_rate, target_rate);
                let mut buf = capture_shared.capture.lock();
                buf.extend(samples);
                let excess = buf.len().saturating_sub(capture_limit);
                buf.drain(..excess);
                drop(buf);
                capture_shared.capture.changed.notify_all();
            },
            move |err| error!("audio input stream error: {err}"),
            None,
        )
        .map_err(|e| DeviceError::Audio(format!("failed to build input stream: {e}")))?;

    let out_channels = usize::from(output_config.channels.max(1));
    let playback_shared = Arc::clone(shared);
    let output = output_device
        .build_output_stream(
            &output_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let gain = f32::from(playback_shared.volume.load(Ordering::Acquire)) / 100.0;
                let enabled = playback_shared.output_on.load(Ordering::Acquire);
                let mut buf = playback_shared.playback.lock();
                for frame in data.chunks_mut(out_channels) {
                    let sample = if enabled {
                        buf.pop_front()
                            .map_or(0.0, |s| f32::from(s) / 32768.0 * gain)
                    } else {
                        0.0
                    };
                    frame.fill(sample);
                }
                drop(buf);
                playback_shared.playback.changed.notify_all();
            },
            move |err| error!("audio output stream error: {err}"),
            None,
        )
        .map_err(|e| DeviceError::Audio(format!("failed to build output stream: {e}")))?;

    input
        .play()
        .map_err(|e| DeviceError::Audio(format!("failed to start input stream: {e}")))?;
    output
        .play()
        .map_err(|e| DeviceError::Audio(format!("failed to start output stream: {e}")))?;

    info!(
        "cpal codec: input {}Hz x{} -> {}Hz, output {}Hz -> {}Hz x{}",
        in_rate,
        in_channels,
        target_rate,
        config.output_sample_rate,
        output_config.sample_rate,
        out_channels
    );

    Ok((input, output, output_config.sample_rate))
}
