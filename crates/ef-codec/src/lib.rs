//! ef-codec: codec/container registry and encoding profiles.
//!
//! Codecs and containers are tagged value types: each variant names a known
//! kind and embeds its parameter record, so a profile copied into a job is a
//! plain clone with no shared state. Each type knows which command-line
//! fragment it contributes to an ffmpeg invocation.

pub mod codec;
pub mod container;
pub mod profile;
pub mod registry;
pub mod store;

pub use codec::{AudioCodecConfig, AudioEncoderSettings, RateControl, VideoCodecConfig, VideoEncoderSettings};
pub use container::{ContainerConfig, HlsSettings, Mp4Settings, SegmentType};
pub use profile::{
    AudioOutput, EncodingOptions, EncodingProfile, HwAccelPreference, ScaleMode, SubtitleOutput,
    VideoOutput,
};
pub use registry::CodecRegistry;
pub use store::ProfileStore;
