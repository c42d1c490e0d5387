//! Codec family strings for the `CODECS` attribute.

use ef_core::AudioCodec;

/// RFC 6381 codec string for an audio codec family.
pub fn audio_codec_string(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "mp4a.40.2",
        AudioCodec::Ac3 => "ac-3",
        AudioCodec::Eac3 => "ec-3",
        AudioCodec::Opus => "Opus",
        AudioCodec::Flac => "fLaC",
        AudioCodec::TrueHd => "mlpa",
        AudioCodec::Dts => "dtsc",
    }
}

/// Join video and audio codec strings into one attribute value.
pub fn codecs_attribute(video: &str, audio: Option<AudioCodec>) -> String {
    match audio {
        Some(a) => format!("{video},{}", audio_codec_string(a)),
        None => video.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_table() {
        assert_eq!(audio_codec_string(AudioCodec::Aac), "mp4a.40.2");
        assert_eq!(audio_codec_string(AudioCodec::Eac3), "ec-3");
        assert_eq!(audio_codec_string(AudioCodec::Ac3), "ac-3");
    }

    #[test]
    fn joined_attribute() {
        assert_eq!(
            codecs_attribute("avc1.640028", Some(AudioCodec::Aac)),
            "avc1.640028,mp4a.40.2"
        );
        assert_eq!(codecs_attribute("hvc1.2.4.L150.B0", None), "hvc1.2.4.L150.B0");
    }
}
