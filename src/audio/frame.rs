//! Audio frames passed between pipeline stages and across the protocol.

/// Payload of one frame: raw PCM inside the pipeline, opaque bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameData {
    /// Mono 16-bit samples.
    Pcm(Vec<i16>),
    /// Encoded payload. The core never looks inside it.
    Encoded(Vec<u8>),
}

/// A timestamped block of audio.
///
/// A frame is produced once and then moved from queue to queue; it is never
/// shared between stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Milliseconds since the producing side started.
    pub timestamp: u32,
    /// Sample rate of the audio this frame carries.
    pub sample_rate: u32,
    pub data: FrameData,
}

impl AudioFrame {
    #[must_use]
    pub fn pcm(samples: Vec<i16>, sample_rate: u32, timestamp: u32) -> Self {
        Self {
            timestamp,
            sample_rate,
            data: FrameData::Pcm(samples),
        }
    }

    #[must_use]
    pub fn encoded(payload: Vec<u8>, sample_rate: u32, timestamp: u32) -> Self {
        Self {
            timestamp,
            sample_rate,
            data: FrameData::Encoded(payload),
        }
    }

    #[must_use]
    pub fn is_encoded(&self) -> bool {
        matches!(self.data, FrameData::Encoded(_))
    }

    /// Encoded bytes, if this is a wire frame.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.data {
            FrameData::Encoded(bytes) => Some(bytes),
            FrameData::Pcm(_) => None,
        }
    }

    /// PCM samples, if this is a pipeline-internal frame.
    #[must_use]
    pub fn samples(&self) -> Option<&[i16]> {
        match &self.data {
            FrameData::Pcm(samples) => Some(samples),
            FrameData::Encoded(_) => None,
        }
    }
}
