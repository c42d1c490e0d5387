//! ef-manifest: HLS playlist generation.
//!
//! The master assembler merges per-task variant outputs into a single
//! `master.m3u8`. Rendering is a pure function of the variant *set*: inputs
//! are sorted on stable keys before anything is written, so any permutation
//! of the same variants yields byte-identical text.

pub mod codecs;
pub mod master;
pub mod media;
pub mod variants;

pub use codecs::audio_codec_string;
pub use master::{assemble_master, group_audio_by_codec, render_master, MASTER_PLAYLIST_NAME};
pub use media::{MediaPlaylist, SegmentEntry};
pub use variants::{AudioVariant, QualityPlaylist, SubtitleVariant};
