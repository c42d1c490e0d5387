//! ffmpeg-backed building blocks used by post-processing and the master
//! task: subtitle sidecars, font extraction, audio language filtering,
//! concatenation of split parts, muxing, HLS packaging and arbitrary
//! commands.

mod audio;
mod concat;
mod exec;
mod fonts;
mod hls;
mod mux;
mod subtitles;

pub use audio::{filter_audio_languages, filter_audio_languages_command};
pub use concat::{concat_list, concat_parts};
pub use exec::{exec_command, substitute_vars};
pub use fonts::{extract_fonts, extract_fonts_command};
pub use hls::{package_hls, package_hls_command};
pub use mux::{mux_streams, mux_streams_command, MuxInput};
pub use subtitles::{extract_subtitle, extract_subtitle_command};
