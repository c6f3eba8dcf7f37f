//! Codec capabilities: the board's audio chip and the frame encoder/decoder.
//!
//! The core only needs "give me PCM" and "play this PCM" from the hardware,
//! and "turn PCM into opaque bytes and back" from the encoder. Concrete
//! implementations live with the board; [`Pcm16Codec`] is the passthrough
//! used on hosts and in tests.

use crate::error::{DeviceError, Result};

/// The board's audio codec chip (microphone in, speaker out).
///
/// Owned exclusively by the audio pipeline while it runs.
pub trait AudioCodec: Send + Sync {
    /// Capture sample rate in Hz.
    fn input_sample_rate(&self) -> u32;

    /// Playback sample rate in Hz.
    fn output_sample_rate(&self) -> u32;

    /// Block until `samples` mono samples have been captured.
    ///
    /// # Errors
    ///
    /// Returns an error on driver faults. The pipeline logs and substitutes silence.
    fn read_frame(&self, samples: usize) -> Result<Vec<i16>>;

    /// Queue mono samples for playback.
    ///
    /// # Errors
    ///
    /// Returns an error on driver faults.
    fn write_frame(&self, pcm: &[i16]) -> Result<()>;

    /// Power the capture path up or down.
    fn enable_input(&self, enabled: bool);

    /// Switch the speaker amplifier on or off.
    fn enable_output(&self, enabled: bool);

    /// Speaker volume, 0..=100.
    fn output_volume(&self) -> u8;

    fn set_output_volume(&self, volume: u8);
}

/// Turns captured PCM into wire payloads.
pub trait AudioEncoder: Send {
    /// Wire name of the produced format, as announced in the hello.
    fn format(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns [`DeviceError::Codec`] when the frame cannot be encoded.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}

/// Turns wire payloads back into PCM.
pub trait AudioDecoder: Send {
    /// Wire name of the accepted format.
    fn format(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns [`DeviceError::Codec`] when the payload is malformed.
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>>;

    /// Drop any inter-frame state (start of a new utterance).
    fn reset(&mut self) {}
}

pub const PCM16_FORMAT: &str = "pcm16";

/// Little-endian 16-bit PCM passthrough.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pcm16Codec;

impl AudioEncoder for Pcm16Codec {
    fn format(&self) -> &'static str {
        PCM16_FORMAT
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(pcm.len() * 2);
        for s in pcm {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Ok(out)
    }
}

impl AudioDecoder for Pcm16Codec {
    fn format(&self) -> &'static str {
        PCM16_FORMAT
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        if payload.len() % 2 != 0 {
            return Err(DeviceError::Codec(format!(
                "odd PCM16 payload length {}",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
    }
}

/// Simple linear-interpolation resampler.
///
/// Good enough for speech between 16kHz and 24kHz; no anti-alias filter.
#[must_use]
pub fn resample_linear(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = samples.len() * dst_rate as usize / src_rate as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };

        output.push(sample.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16);
    }

    output
}

/// RMS energy of a frame, normalised to \[0, 1\].
#[must_use]
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}
