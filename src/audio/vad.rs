//! Voice activity detection using energy-based analysis.
//!
//! Frames whose RMS energy exceeds the threshold count as speech. A short
//! hangover keeps the decision on across brief pauses between words.

use crate::audio::codec::rms_energy;
use crate::config::VadConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Energy VAD with a speech hangover.
///
/// The latest decision is mirrored into a shared flag so other threads can
/// read it without touching the capture stage.
pub struct EnergyVad {
    threshold: f32,
    hangover_frames: u32,
    /// Consecutive silent frames seen while in speech.
    silence_count: u32,
    in_speech: bool,
    detected: Arc<AtomicBool>,
}

impl EnergyVad {
    #[must_use]
    pub fn new(config: &VadConfig) -> Self {
        info!(
            "VAD initialized: threshold={}, hangover={} frames",
            config.threshold, config.hangover_frames
        );
        Self {
            threshold: config.threshold,
            hangover_frames: config.hangover_frames,
            silence_count: 0,
            in_speech: false,
            detected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Classify one frame and return the (hangover-smoothed) decision.
    pub fn process(&mut self, samples: &[i16]) -> bool {
        let energy = rms_energy(samples);
        if energy > self.threshold {
            if !self.in_speech {
                debug!("speech start (rms={energy:.4})");
            }
            self.in_speech = true;
            self.silence_count = 0;
        } else if self.in_speech {
            self.silence_count += 1;
            if self.silence_count > self.hangover_frames {
                debug!("speech end");
                self.in_speech = false;
                self.silence_count = 0;
            }
        }
        self.detected.store(self.in_speech, Ordering::Release);
        self.in_speech
    }

    /// Latest decision.
    #[must_use]
    pub fn is_voice_detected(&self) -> bool {
        self.detected.load(Ordering::Acquire)
    }

    /// Shared handle to the latest decision.
    #[must_use]
    pub fn detected_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.detected)
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
        self.silence_count = 0;
        self.detected.store(false, Ordering::Release);
    }
}
