use crate::tts::{AudioFormat, SpeechAudio, SynthesisClient, SynthesisRequest, TtsError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

const SAMPLE_RATE_HZ: u32 = 24_000;
const MS_PER_CHAR: usize = 60;
const MIN_DURATION_MS: usize = 300;
const MAX_DURATION_MS: usize = 10_000;

/// Offline client that renders a sine tone as a WAV container.
///
/// The tone length scales with the text and its pitch with the requested
/// speed, so distinct requests produce distinct audio.
#[derive(Debug, Default)]
pub struct ToneSynthesisClient {
    calls: AtomicU64,
}

impl ToneSynthesisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of syntheses performed so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn render(request: &SynthesisRequest) -> Vec<u8> {
        let chars = request.text.chars().count();
        let duration_ms = (chars * MS_PER_CHAR).clamp(MIN_DURATION_MS, MAX_DURATION_MS);
        let speed = request.options.speed.unwrap_or(1.0);
        let freq = 220.0 * speed.clamp(0.25, 4.0);

        let samples = duration_ms * SAMPLE_RATE_HZ as usize / 1000;
        let mut pcm = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let t = i as f32 / SAMPLE_RATE_HZ as f32;
            let amplitude = (2.0 * PI * freq * t).sin() * 0.5;
            let sample = (amplitude * f32::from(i16::MAX)) as i16;
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        wav_container(SAMPLE_RATE_HZ, 1, &pcm)
    }
}

/// Wraps 16-bit little-endian PCM in a canonical 44-byte RIFF header.
pub(crate) fn wav_container(sample_rate_hz: u32, channels: u16, pcm: &[u8]) -> Vec<u8> {
    let data_len = u32::try_from(pcm.len()).unwrap_or(u32::MAX);
    let block_align = channels * 2;
    let byte_rate = sample_rate_hz * u32::from(block_align);

    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36u32.saturating_add(data_len)).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate_hz.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

impl SynthesisClient for ToneSynthesisClient {
    fn synthesize<'a>(
        &'a self,
        request: &'a SynthesisRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SpeechAudio, TtsError>> {
        async move {
            if cancel.is_cancelled() {
                return Err(TtsError::Cancelled);
            }
            self.calls.fetch_add(1, Ordering::Relaxed);
            let wav = Self::render(request);
            Ok(SpeechAudio::new(wav, AudioFormat::Wav.content_type()))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::{probe_duration, sniff_container};
    use std::time::Duration;

    #[tokio::test]
    async fn renders_wav_scaled_to_text() {
        let client = ToneSynthesisClient::new();
        let short = client
            .synthesize(&SynthesisRequest::new("hi"), &CancellationToken::new())
            .await
            .expect("tone");
        let long = client
            .synthesize(
                &SynthesisRequest::new("a considerably longer sentence"),
                &CancellationToken::new(),
            )
            .await
            .expect("tone");

        assert_eq!(sniff_container(&short.bytes), Some(AudioFormat::Wav));
        assert_eq!(short.content_type, "audio/wav");
        assert!(long.len() > short.len());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn tone_duration_is_probeable() {
        let client = ToneSynthesisClient::new();
        let out = client
            .synthesize(&SynthesisRequest::new("hello"), &CancellationToken::new())
            .await
            .expect("tone");
        // 5 chars * 60ms = 300ms
        let duration = probe_duration(&out.bytes).expect("wav duration");
        assert_eq!(duration, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = ToneSynthesisClient::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .synthesize(&SynthesisRequest::new("hi"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, TtsError::Cancelled);
        assert_eq!(client.calls(), 0);
    }
}
