//! Audio capture, processing and playback.

pub mod codec;
#[cfg(feature = "host-audio")]
pub mod cpal_codec;
pub mod frame;
pub mod pipeline;
pub mod queue;
pub mod sounds;
pub mod vad;
pub mod wakeword;

pub use codec::{AudioCodec, AudioDecoder, AudioEncoder, Pcm16Codec};
pub use frame::{AudioFrame, FrameData};
pub use pipeline::{
    AudioPipeline, AudioSink, InboundHandle, PipelineEvent, PipelineObserver, PipelineParts,
    SinkError,
};
pub use sounds::SoundBank;
pub use wakeword::{KeywordSpotter, WakeWordEngine};
