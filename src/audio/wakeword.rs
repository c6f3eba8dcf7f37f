//! Offline wake word detection.
//!
//! [`KeywordSpotter`] compares MFCC features of a sliding one-second window
//! against reference recordings of the keyword using DTW. Detection runs on
//! the capture thread, so everything here is synchronous and allocation-light.

use crate::audio::codec::resample_linear;
use crate::audio::sounds::read_wav_mono;
use crate::config::WakewordConfig;
use crate::error::{DeviceError, Result};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use std::path::Path;
use tracing::{debug, info, warn};

/// A wake word detector fed with captured PCM frames.
pub trait WakeWordEngine: Send {
    /// Feed one capture frame. Returns the keyword when it was just spoken.
    fn feed(&mut self, pcm: &[i16]) -> Option<String>;

    /// Forget buffered audio (detection was just re-enabled).
    fn reset(&mut self);
}

const DEFAULT_NUM_MFCC: usize = 13;
/// 25ms analysis window at 16kHz.
const FRAME_SIZE: usize = 400;
/// 10ms hop at 16kHz.
const HOP_SIZE: usize = 160;
const NUM_MEL_FILTERS: usize = 26;
/// Rate the features are computed at; other capture rates are resampled.
const ANALYSIS_RATE: u32 = 16_000;

/// MFCC + DTW keyword spotter.
pub struct KeywordSpotter {
    keyword: String,
    /// One MFCC sequence per reference recording.
    references: Vec<Vec<Vec<f32>>>,
    mel_filterbank: Vec<Vec<f32>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f32>>,
    num_mfcc: usize,
    /// Largest DTW distance that still counts as a match.
    threshold: f32,
    input_rate: u32,
    buffer: Vec<f32>,
    window_samples: usize,
}

impl KeywordSpotter {
    /// Load every `*.wav` under `config.references_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Config`] if no usable reference is found.
    pub fn new(config: &WakewordConfig, input_rate: u32) -> Result<Self> {
        let references = load_reference_clips(&config.references_dir)?;
        Self::from_clips(config, input_rate, &references)
    }

    /// Build from in-memory 16kHz reference clips.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Config`] if `clips` yields no features.
    pub fn from_clips(config: &WakewordConfig, input_rate: u32, clips: &[Vec<i16>]) -> Result<Self> {
        if input_rate == 0 {
            return Err(DeviceError::Config("wake word input rate is zero".into()));
        }
        let num_mfcc = if config.num_mfcc > 0 {
            config.num_mfcc
        } else {
            DEFAULT_NUM_MFCC
        };
        let mel_filterbank = build_mel_filterbank(NUM_MEL_FILTERS, FRAME_SIZE, ANALYSIS_RATE);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FRAME_SIZE);

        let references: Vec<Vec<Vec<f32>>> = clips
            .iter()
            .map(|clip| {
                let samples = to_f32(clip);
                extract_mfccs(&samples, num_mfcc, &mel_filterbank, fft.as_ref())
            })
            .filter(|mfccs| !mfccs.is_empty())
            .collect();

        if references.is_empty() {
            return Err(DeviceError::Config(
                "no wake word reference recordings found".into(),
            ));
        }

        info!(
            "keyword spotter for {:?}: {} references, threshold={}",
            config.keyword,
            references.len(),
            config.threshold
        );

        let window_samples = ANALYSIS_RATE as usize;
        Ok(Self {
            keyword: config.keyword.clone(),
            references,
            mel_filterbank,
            fft,
            num_mfcc,
            threshold: config.threshold,
            input_rate,
            buffer: Vec::with_capacity(window_samples * 2),
            window_samples,
        })
    }

    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// Best (lowest) DTW distance of the current window against any reference.
    fn best_distance(&self, window: &[f32]) -> f32 {
        let mfccs = extract_mfccs(
            window,
            self.num_mfcc,
            &self.mel_filterbank,
            self.fft.as_ref(),
        );
        self.references
            .iter()
            .map(|reference| dtw_distance(&mfccs, reference))
            .fold(f32::MAX, f32::min)
    }
}

impl WakeWordEngine for KeywordSpotter {
    fn feed(&mut self, pcm: &[i16]) -> Option<String> {
        if self.input_rate == ANALYSIS_RATE {
            self.buffer.extend(pcm.iter().map(|&s| f32::from(s) / 32768.0));
        } else {
            let resampled = resample_linear(pcm, self.input_rate, ANALYSIS_RATE);
            self.buffer.extend(resampled.iter().map(|&s| f32::from(s) / 32768.0));
        }

        if self.buffer.len() < self.window_samples {
            return None;
        }

        let start = self.buffer.len() - self.window_samples;
        let distance = self.best_distance(&self.buffer[start..]);
        trace_distance(distance, self.threshold);

        if distance <= self.threshold {
            self.buffer.clear();
            return Some(self.keyword.clone());
        }

        // Keep half a window of overlap for the next comparison.
        let keep = self.window_samples / 2;
        let drain = self.buffer.len().saturating_sub(keep);
        self.buffer.drain(..drain);
        None
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn trace_distance(distance: f32, threshold: f32) {
    if distance <= threshold * 1.5 {
        debug!("wake word candidate: distance={distance:.2} threshold={threshold:.2}");
    }
}

fn to_f32(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// Read every WAV reference in `dir`, resampled to the analysis rate.
fn load_reference_clips(dir: &Path) -> Result<Vec<Vec<i16>>> {
    if !dir.exists() {
        return Err(DeviceError::Config(format!(
            "wake word references dir {} does not exist",
            dir.display()
        )));
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|e| DeviceError::Config(format!("cannot read references dir: {e}")))?;

    let mut clips = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| DeviceError::Config(format!("cannot read dir entry: {e}")))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }
        match read_wav_mono(&path) {
            Ok((samples, rate)) => {
                info!("loaded wake word reference: {}", path.display());
                clips.push(resample_linear(&samples, rate, ANALYSIS_RATE));
            }
            Err(e) => warn!("skipping invalid reference {}: {e}", path.display()),
        }
    }
    Ok(clips)
}

// ── MFCC extraction ─────────────────────────────────────────────────

fn extract_mfccs(
    samples: &[f32],
    num_mfcc: usize,
    mel_filterbank: &[Vec<f32>],
    fft: &dyn rustfft::Fft<f32>,
) -> Vec<Vec<f32>> {
    if samples.len() < FRAME_SIZE {
        return Vec::new();
    }

    let num_frames = (samples.len() - FRAME_SIZE) / HOP_SIZE + 1;
    let power_len = FRAME_SIZE / 2 + 1;
    let mut frames = Vec::with_capacity(num_frames);
    let mut windowed = vec![Complex::new(0.0f32, 0.0); FRAME_SIZE];

    for i in 0..num_frames {
        let start = i * HOP_SIZE;
        for (n, (slot, &s)) in windowed
            .iter_mut()
            .zip(&samples[start..start + FRAME_SIZE])
            .enumerate()
        {
            let w = 0.5
                * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (FRAME_SIZE - 1) as f32).cos());
            *slot = Complex::new(s * w, 0.0);
        }

        fft.process(&mut windowed);

        let power: Vec<f32> = windowed[..power_len]
            .iter()
            .map(|c| c.norm_sqr() / FRAME_SIZE as f32)
            .collect();

        let log_mel: Vec<f32> = mel_filterbank
            .iter()
            .map(|filter| {
                let energy: f32 = filter.iter().zip(&power).map(|(&f, &p)| f * p).sum();
                energy.max(1e-10).ln()
            })
            .collect();

        frames.push(dct_ii(&log_mel, num_mfcc));
    }

    frames
}

/// Triangular filters evenly spaced on the mel scale.
fn build_mel_filterbank(num_filters: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let power_len = fft_size / 2 + 1;
    let low = hz_to_mel(0.0);
    let high = hz_to_mel(sample_rate as f32 / 2.0);
    let num_points = num_filters + 2;

    let bins: Vec<usize> = (0..num_points)
        .map(|i| {
            let mel = low + (high - low) * i as f32 / (num_points - 1) as f32;
            ((fft_size as f32 + 1.0) * mel_to_hz(mel) / sample_rate as f32).floor() as usize
        })
        .collect();

    (0..num_filters)
        .map(|m| {
            let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
            let mut filter = vec![0.0f32; power_len];
            for (i, val) in filter.iter_mut().enumerate() {
                if i >= left && i < center && center > left {
                    *val = (i - left) as f32 / (center - left) as f32;
                } else if i >= center && i <= right && right > center {
                    *val = (right - i) as f32 / (right - center) as f32;
                }
            }
            filter
        })
        .collect()
}

fn dct_ii(input: &[f32], num_coeffs: usize) -> Vec<f32> {
    let n = input.len();
    (0..num_coeffs)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, &val)| {
                    val * (std::f32::consts::PI * k as f32 * (2 * i + 1) as f32 / (2 * n) as f32)
                        .cos()
                })
                .sum()
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

// ── DTW ─────────────────────────────────────────────────────────────

/// DTW distance normalised by path length. `f32::MAX` if either side is empty.
fn dtw_distance(input: &[Vec<f32>], reference: &[Vec<f32>]) -> f32 {
    let (n, m) = (input.len(), reference.len());
    if n == 0 || m == 0 {
        return f32::MAX;
    }

    // Two rolling rows are enough.
    let mut prev = vec![f32::MAX; m + 1];
    let mut curr = vec![f32::MAX; m + 1];
    prev[0] = 0.0;

    for row in input {
        curr[0] = f32::MAX;
        for j in 1..=m {
            let d = euclidean_distance(row, &reference[j - 1]);
            let best = prev[j].min(curr[j - 1]).min(prev[j - 1]);
            curr[j] = if best == f32::MAX { f32::MAX } else { d + best };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m] / (n + m) as f32
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    /// Deterministic broadband noise so every mel band carries energy.
    fn noise(len: usize, seed: u32) -> Vec<i16> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 16) as i16) / 4
            })
            .collect()
    }

    fn config() -> WakewordConfig {
        WakewordConfig {
            keyword: "hi fae".into(),
            threshold: 25.0,
            ..WakewordConfig::default()
        }
    }

    #[test]
    fn mel_filterbank_shape() {
        let fb = build_mel_filterbank(NUM_MEL_FILTERS, FRAME_SIZE, ANALYSIS_RATE);
        assert_eq!(fb.len(), NUM_MEL_FILTERS);
        assert!(fb.iter().all(|f| f.len() == FRAME_SIZE / 2 + 1));
        assert!(fb.iter().flatten().all(|&v| v >= 0.0));
    }

    #[test]
    fn hz_mel_inverse() {
        let back = mel_to_hz(hz_to_mel(1000.0));
        assert!((back - 1000.0).abs() < 0.1);
    }

    #[test]
    fn dct_dc_is_sum() {
        let result = dct_ii(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(result.len(), 3);
        assert!((result[0] - 10.0).abs() < 0.01);
    }

    #[test]
    fn mfcc_frame_count() {
        let fb = build_mel_filterbank(NUM_MEL_FILTERS, FRAME_SIZE, ANALYSIS_RATE);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FRAME_SIZE);
        assert!(extract_mfccs(&[0.0; FRAME_SIZE - 1], 13, &fb, fft.as_ref()).is_empty());
        // (8000 - 400) / 160 + 1
        assert_eq!(extract_mfccs(&[0.0; 8000], 13, &fb, fft.as_ref()).len(), 48);
    }

    #[test]
    fn dtw_properties() {
        let seq = vec![vec![1.0, 2.0], vec![4.0, 5.0]];
        assert!(dtw_distance(&seq, &seq) < 0.001);

        let short = vec![vec![1.0, 2.0]];
        let long = vec![vec![1.0, 2.0]; 3];
        assert!(dtw_distance(&long, &short) < 0.001);

        let far = vec![vec![10.0, 10.0]; 2];
        assert!(dtw_distance(&seq, &far) > 1.0);
        assert_eq!(dtw_distance(&[], &seq), f32::MAX);
    }

    #[test]
    fn no_references_is_config_error() {
        let err = KeywordSpotter::from_clips(&config(), 16_000, &[]).err().unwrap();
        assert!(matches!(err, DeviceError::Config(_)));
    }

    #[test]
    fn missing_references_dir_is_config_error() {
        let mut cfg = config();
        cfg.references_dir = std::env::temp_dir().join("fae-device-no-such-dir");
        assert!(KeywordSpotter::new(&cfg, 16_000).is_err());
    }

    #[test]
    fn detects_window_matching_reference() {
        let clip = noise(16_000, 7);
        let mut spotter = KeywordSpotter::from_clips(&config(), 16_000, &[clip.clone()]).unwrap();
        assert_eq!(spotter.reference_count(), 1);
        assert_eq!(spotter.feed(&clip).as_deref(), Some("hi fae"));
    }

    #[test]
    fn silence_does_not_trigger() {
        let clip = noise(16_000, 7);
        let mut spotter = KeywordSpotter::from_clips(&config(), 16_000, &[clip]).unwrap();
        for _ in 0..40 {
            assert!(spotter.feed(&[0; 960]).is_none());
        }
    }

    #[test]
    fn buffer_waits_for_full_window() {
        let clip = noise(16_000, 3);
        let mut spotter = KeywordSpotter::from_clips(&config(), 16_000, &[clip.clone()]).unwrap();
        assert!(spotter.feed(&clip[..8_000]).is_none());
        spotter.reset();
        assert!(spotter.feed(&clip[8_000..]).is_none());
    }
}
