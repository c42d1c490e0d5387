//! Where each task writes its artifacts.
//!
//! Segmented outputs land directly in the job output folder, one directory
//! per rendition, so the master playlist can reference them by relative URI.
//! Single-file containers encode each stream into the job's work directory
//! and the master task muxes them into the output folder.

use std::path::{Path, PathBuf};

use ef_codec::codec::subtitle_extension;
use ef_codec::container::MEDIA_PLAYLIST_NAME;
use ef_codec::{AudioCodecConfig, ContainerConfig};
use ef_core::{JobId, SubtitleCodec};

/// File name of the WebVTT sidecar inside a subtitle rendition directory.
pub const SUBTITLE_FILE_NAME: &str = "subtitles.vtt";

/// Paths for one job.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    output_dir: PathBuf,
    work_dir: PathBuf,
    stem: String,
}

impl OutputLayout {
    pub fn new(job_id: JobId, input: &Path, output_dir: &Path, work_root: &Path) -> Self {
        let stem = input
            .file_stem()
            .map(|s| sanitize(&s.to_string_lossy()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "output".to_string());
        Self {
            output_dir: output_dir.to_path_buf(),
            work_dir: work_root.join(job_id.to_string()),
            stem,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Base name of final single-file outputs, taken from the source.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    // -- Segmented renditions (relative to the output folder) --

    pub fn video_uri(name: &str) -> String {
        format!("video_{}/{MEDIA_PLAYLIST_NAME}", sanitize(name))
    }

    pub fn audio_uri(language: Option<&str>, codec: &AudioCodecConfig, stream_index: u32) -> String {
        format!(
            "audio_{}_{}_{stream_index}/{MEDIA_PLAYLIST_NAME}",
            sanitize(language.unwrap_or("und")),
            codec.kind()
        )
    }

    pub fn subtitle_uri(language: Option<&str>, stream_index: u32) -> String {
        format!(
            "subs_{}_{stream_index}/{MEDIA_PLAYLIST_NAME}",
            sanitize(language.unwrap_or("und"))
        )
    }

    /// Absolute path of a rendition playlist given its URI.
    pub fn resolve(&self, uri: &str) -> PathBuf {
        self.output_dir.join(uri)
    }

    // -- Intermediates (work directory) --

    /// One part of a split video encode.
    pub fn part_path(&self, output_name: &str, index: u32) -> PathBuf {
        self.work_dir
            .join(format!("video_{}_part_{index:03}.mkv", sanitize(output_name)))
    }

    /// Concatenation of all parts of a split video output.
    pub fn joined_path(&self, output_name: &str) -> PathBuf {
        self.work_dir
            .join(format!("video_{}_joined.mkv", sanitize(output_name)))
    }

    pub fn video_intermediate(&self, output_name: &str, container: &ContainerConfig) -> PathBuf {
        self.work_dir.join(format!(
            "video_{}.{}",
            sanitize(output_name),
            container.format().extension()
        ))
    }

    pub fn audio_intermediate(
        &self,
        language: Option<&str>,
        codec: &AudioCodecConfig,
        stream_index: u32,
        container: &ContainerConfig,
    ) -> PathBuf {
        self.work_dir.join(format!(
            "audio_{}_{}_{stream_index}.{}",
            sanitize(language.unwrap_or("und")),
            codec.kind(),
            container.format().extension()
        ))
    }

    pub fn subtitle_intermediate(
        &self,
        language: Option<&str>,
        codec: SubtitleCodec,
        stream_index: u32,
    ) -> PathBuf {
        self.work_dir.join(format!(
            "subs_{}_{stream_index}.{}",
            sanitize(language.unwrap_or("und")),
            subtitle_extension(codec)
        ))
    }

    /// Final single-file output for one video rendition. With a single
    /// rendition the output carries the source name unchanged.
    pub fn final_file(&self, rendition: Option<&str>, container: &ContainerConfig) -> PathBuf {
        let name = match rendition {
            Some(r) => format!("{}_{}", self.stem, sanitize(r)),
            None => self.stem.clone(),
        };
        self.output_dir
            .join(format!("{name}.{}", container.format().extension()))
    }
}

/// Restrict a label to characters safe in file names.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_codec::{AudioEncoderSettings, Mp4Settings};

    fn layout() -> OutputLayout {
        OutputLayout::new(
            JobId::from_u128(7),
            Path::new("/media/My Movie (2020).mkv"),
            Path::new("/out/movie"),
            Path::new("/tmp/ef"),
        )
    }

    #[test]
    fn stem_is_sanitized() {
        assert_eq!(layout().stem(), "My_Movie__2020_");
    }

    #[test]
    fn rendition_uris() {
        let aac = AudioCodecConfig::Aac(AudioEncoderSettings::default());
        assert_eq!(OutputLayout::video_uri("1080p"), "video_1080p/index.m3u8");
        assert_eq!(OutputLayout::audio_uri(Some("eng"), &aac, 1), "audio_eng_aac_1/index.m3u8");
        assert_eq!(OutputLayout::subtitle_uri(None, 4), "subs_und_4/index.m3u8");
        assert_eq!(
            layout().resolve("video_1080p/index.m3u8"),
            PathBuf::from("/out/movie/video_1080p/index.m3u8")
        );
    }

    #[test]
    fn intermediates_live_in_job_work_dir() {
        let l = layout();
        let work = PathBuf::from("/tmp/ef").join(JobId::from_u128(7).to_string());
        assert_eq!(l.work_dir(), work);
        assert_eq!(l.part_path("720p", 2), work.join("video_720p_part_002.mkv"));
        assert_eq!(
            l.subtitle_intermediate(Some("eng"), SubtitleCodec::MovText, 4),
            work.join("subs_eng_4.mp4")
        );
    }

    #[test]
    fn final_file_names() {
        let l = layout();
        let mp4 = ContainerConfig::Mp4(Mp4Settings::default());
        assert_eq!(l.final_file(None, &mp4), PathBuf::from("/out/movie/My_Movie__2020_.mp4"));
        assert_eq!(
            l.final_file(Some("720p"), &ContainerConfig::Mkv),
            PathBuf::from("/out/movie/My_Movie__2020__720p.mkv")
        );
    }
}
