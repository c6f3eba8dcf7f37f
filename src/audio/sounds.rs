//! Short embedded clips played by `PlaySound`.
//!
//! The built-in cues are synthesised at startup so the crate ships no binary
//! assets. Boards with real recordings replace them with [`SoundBank::load_wav`].

use crate::error::{DeviceError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Played when a listening turn opens.
pub const POPUP: &str = "popup";
/// Played after activation succeeds.
pub const SUCCESS: &str = "success";
/// Played with alerts.
pub const EXCLAMATION: &str = "exclamation";
pub const VIBRATION: &str = "vibration";

/// A named set of mono PCM clips at one sample rate.
#[derive(Debug, Clone)]
pub struct SoundBank {
    sample_rate: u32,
    clips: HashMap<String, Arc<[i16]>>,
}

impl SoundBank {
    /// An empty bank.
    #[must_use]
    pub fn empty(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            clips: HashMap::new(),
        }
    }

    /// Bank holding the synthesised built-in cues.
    #[must_use]
    pub fn builtin(sample_rate: u32) -> Self {
        let mut bank = Self::empty(sample_rate);
        bank.insert(POPUP, tone_sequence(sample_rate, &[(880.0, 70), (1_320.0, 90)]));
        bank.insert(
            SUCCESS,
            tone_sequence(sample_rate, &[(660.0, 80), (880.0, 80), (1_320.0, 140)]),
        );
        bank.insert(
            EXCLAMATION,
            tone_sequence(sample_rate, &[(1_000.0, 120), (0.0, 60), (1_000.0, 120)]),
        );
        bank.insert(VIBRATION, tone_sequence(sample_rate, &[(150.0, 300)]));
        bank
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Add or replace a clip. Samples must already be at the bank's rate.
    pub fn insert(&mut self, name: impl Into<String>, samples: Vec<i16>) {
        self.clips.insert(name.into(), Arc::from(samples));
    }

    /// Load a WAV file as clip `name`, resampled to the bank's rate.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Audio`] if the file cannot be decoded.
    pub fn load_wav(&mut self, name: &str, path: &Path) -> Result<()> {
        let (samples, rate) = read_wav_mono(path)?;
        let samples = crate::audio::codec::resample_linear(&samples, rate, self.sample_rate);
        info!("loaded sound {name:?} from {}", path.display());
        self.insert(name, samples);
        Ok(())
    }

    /// Look up a clip.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Audio`] for unknown identifiers.
    pub fn get(&self, name: &str) -> Result<Arc<[i16]>> {
        self.clips
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::Audio(format!("unknown sound {name:?}")))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.clips.contains_key(name)
    }

    /// Clip names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clips.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Concatenate `(frequency_hz, duration_ms)` segments; 0Hz is a gap.
fn tone_sequence(sample_rate: u32, segments: &[(f32, u32)]) -> Vec<i16> {
    let mut out = Vec::new();
    for &(freq, ms) in segments {
        let len = (sample_rate as usize * ms as usize) / 1000;
        // 5ms linear fade at each edge avoids clicks.
        let fade = (sample_rate as usize / 200).max(1).min(len / 2).max(1);
        for i in 0..len {
            if freq <= 0.0 {
                out.push(0);
                continue;
            }
            let t = i as f32 / sample_rate as f32;
            let env = (i.min(len - 1 - i) as f32 / fade as f32).min(1.0);
            let v = (2.0 * std::f32::consts::PI * freq * t).sin() * 0.4 * env;
            out.push((v * f32::from(i16::MAX)) as i16);
        }
    }
    out
}

/// Read a WAV file as mono 16-bit PCM, returning the samples and their rate.
///
/// # Errors
///
/// Returns [`DeviceError::Audio`] if the file is missing or malformed.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| DeviceError::Audio(format!("cannot open WAV {}: {e}", path.display())))?;
    let spec = reader.spec();

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let shift = i32::from(spec.bits_per_sample).saturating_sub(16);
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        if shift >= 0 {
                            (v >> shift) as i16
                        } else {
                            (v << -shift) as i16
                        }
                    })
                    .map_err(|e| DeviceError::Audio(format!("WAV read error: {e}")))
                })
                .collect::<Result<_>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| {
                s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
                    .map_err(|e| DeviceError::Audio(format!("WAV read error: {e}")))
            })
            .collect::<Result<_>>()?,
    };

    let channels = usize::from(spec.channels.max(1));
    let mono = if channels > 1 {
        interleaved
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    } else {
        interleaved
    };

    Ok((mono, spec.sample_rate))
}
