use crate::tts::AudioFormat;
use bytes::Bytes;
use std::time::Duration;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Identifies the container from its leading bytes.
pub fn sniff_container(bytes: &[u8]) -> Option<AudioFormat> {
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return Some(AudioFormat::Wav);
    }
    if bytes.starts_with(b"ID3") {
        return Some(AudioFormat::Mp3);
    }
    // MPEG audio frame sync; layer bits of 00 (reserved, used by ADTS) are rejected
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0 && bytes[1] & 0x06 != 0 {
        return Some(AudioFormat::Mp3);
    }
    None
}

/// Best-effort playback length. Returns `None` when the container cannot be
/// parsed; never fails the request.
pub fn probe_duration(bytes: &Bytes) -> Option<Duration> {
    let mut hint = Hint::new();
    if let Some(format) = sniff_container(bytes) {
        hint.with_extension(format.as_str());
    }
    let source = MediaSourceStream::new(Box::new(std::io::Cursor::new(bytes.clone())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .ok()?;
    let mut reader = probed.format;

    let (track_id, sample_rate, n_frames) = {
        let track = reader.default_track()?;
        (
            track.id,
            track.codec_params.sample_rate?,
            track.codec_params.n_frames,
        )
    };
    if let Some(frames) = n_frames {
        return Some(frames_to_duration(frames, sample_rate));
    }

    let mut frames = 0u64;
    while let Ok(packet) = reader.next_packet() {
        if packet.track_id() == track_id {
            frames += packet.dur;
        }
    }
    (frames > 0).then(|| frames_to_duration(frames, sample_rate))
}

fn frames_to_duration(frames: u64, sample_rate_hz: u32) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::ZERO;
    }
    let micros = u128::from(frames) * 1_000_000 / u128::from(sample_rate_hz);
    Duration::from_micros(micros.min(u128::from(u64::MAX)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::wav_container;

    #[test]
    fn sniffs_wav_and_mp3() {
        let wav = wav_container(16_000, 1, &[0, 0, 1, 0]);
        assert_eq!(sniff_container(&wav), Some(AudioFormat::Wav));
        assert_eq!(sniff_container(b"ID3\x04\x00rest"), Some(AudioFormat::Mp3));
        assert_eq!(sniff_container(&[0xFF, 0xFB, 0x90, 0x64]), Some(AudioFormat::Mp3));
    }

    #[test]
    fn rejects_json_and_adts() {
        assert_eq!(sniff_container(br#"{"error":"x"}"#), None);
        assert_eq!(sniff_container(&[0xFF, 0xF1, 0x50, 0x80]), None);
        assert_eq!(sniff_container(b""), None);
    }

    #[test]
    fn wav_duration_from_header() {
        // 1 second of 16 kHz mono 16-bit silence
        let wav = wav_container(16_000, 1, &vec![0u8; 32_000]);
        assert_eq!(
            probe_duration(&Bytes::from(wav)),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn garbage_has_no_duration() {
        assert_eq!(probe_duration(&Bytes::from_static(b"not audio at all")), None);
    }

    #[test]
    fn frame_math() {
        assert_eq!(frames_to_duration(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(frames_to_duration(12, 0), Duration::ZERO);
    }
}
