//! Post-cache audio assembly: chime prefix, loudness normalization and
//! container conversion, all through one ffmpeg run per request.

mod assets;
mod ffmpeg;
mod probe;

pub use assets::{AssetError, AssetProvider, DirectoryAssetProvider, StaticAssetProvider};
pub use probe::{probe_duration, sniff_container};

use crate::config::AssemblerConfig;
use crate::tts::{AudioFormat, ErrorKind, SpeechAudio, TtsError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "tts::assemble";

/// Per-call presentation flags. Never part of the cache key.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostProcessSpec {
    pub chime_enabled: bool,
    pub chime_asset: Option<String>,
    pub normalize: bool,
    /// Return the unprocessed speech instead of failing when ffmpeg fails.
    pub lenient: bool,
}

impl PostProcessSpec {
    pub fn with_chime(mut self, asset: impl Into<String>) -> Self {
        self.chime_enabled = true;
        self.chime_asset = Some(asset.into());
        self
    }

    pub fn with_normalize(mut self) -> Self {
        self.normalize = true;
        self
    }

    pub fn with_lenient(mut self) -> Self {
        self.lenient = true;
        self
    }

    fn needs_processing(&self) -> bool {
        self.chime_enabled || self.normalize
    }
}

/// Final playable audio handed back to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Bytes,
    pub format: AudioFormat,
    pub duration: Option<Duration>,
}

impl AudioClip {
    fn new(bytes: Bytes, format: AudioFormat) -> Self {
        let duration = probe_duration(&bytes);
        Self {
            bytes,
            format,
            duration,
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

pub struct Assembler {
    config: AssemblerConfig,
    assets: Arc<dyn AssetProvider>,
    /// Resolved once; a failed or cancelled resolution is retried next call.
    binary: OnceCell<PathBuf>,
}

impl Assembler {
    pub fn new(config: AssemblerConfig, assets: Arc<dyn AssetProvider>) -> Self {
        Self {
            config,
            assets,
            binary: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Turns cached speech into the clip the caller asked for.
    ///
    /// Speech already in `target` with no chime and no normalization is
    /// returned as is; everything else goes through ffmpeg.
    pub async fn assemble(
        &self,
        speech: &SpeechAudio,
        target: AudioFormat,
        spec: &PostProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<AudioClip, TtsError> {
        let source = AudioFormat::from_content_type(&speech.content_type)
            .or_else(|| sniff_container(&speech.bytes));
        if !spec.needs_processing() && source == Some(target) {
            return Ok(AudioClip::new(speech.bytes.clone(), target));
        }

        match self.process(speech, source, target, spec, cancel).await {
            Ok(clip) => Ok(clip),
            Err(err)
                if spec.lenient
                    && matches!(err.kind(), ErrorKind::PostProcessFailed | ErrorKind::Timeout) =>
            {
                tracing::warn!(
                    target: LOG_TARGET,
                    error = %err,
                    "post-processing failed; returning unprocessed speech"
                );
                Ok(AudioClip::new(
                    speech.bytes.clone(),
                    source.unwrap_or(target),
                ))
            }
            Err(err) => Err(err),
        }
    }

    async fn process(
        &self,
        speech: &SpeechAudio,
        source: Option<AudioFormat>,
        target: AudioFormat,
        spec: &PostProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<AudioClip, TtsError> {
        let chime = if spec.chime_enabled {
            let name = spec
                .chime_asset
                .as_deref()
                .ok_or_else(|| TtsError::PostProcess("chime enabled without an asset".into()))?;
            let bytes = self
                .assets
                .resolve(name)
                .await
                .map_err(|e| TtsError::PostProcess(e.to_string()))?;
            Some(bytes)
        } else {
            None
        };

        let binary = self
            .binary
            .get_or_try_init(|| ffmpeg::resolve_binary(&self.config, cancel))
            .await?;
        let workdir = tempfile::tempdir()
            .map_err(|e| TtsError::PostProcess(format!("failed to create work dir: {e}")))?;

        let speech_path = workdir.path().join(file_name("speech", source));
        write_input(&speech_path, &speech.bytes).await?;
        let chime_path = match &chime {
            Some(bytes) => {
                let path = workdir.path().join(file_name("chime", sniff_container(bytes)));
                write_input(&path, bytes).await?;
                Some(path)
            }
            None => None,
        };
        let output_path = workdir.path().join(format!("out.{}", target.as_str()));

        let args = ffmpeg::build_args(
            chime_path.as_deref(),
            &speech_path,
            spec.normalize,
            target,
            &self.config,
            &output_path,
        );
        let started = Instant::now();
        ffmpeg::run_ffmpeg(binary, &args, self.config.process_timeout, cancel).await?;

        let bytes = tokio::fs::read(&output_path)
            .await
            .map_err(|e| TtsError::PostProcess(format!("failed to read ffmpeg output: {e}")))?;
        if bytes.is_empty() {
            return Err(TtsError::PostProcess("ffmpeg produced no output".into()));
        }
        tracing::debug!(
            target: LOG_TARGET,
            chime = chime.is_some(),
            normalize = spec.normalize,
            format = %target,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "assembled clip"
        );
        Ok(AudioClip::new(Bytes::from(bytes), target))
    }
}

fn file_name(stem: &str, format: Option<AudioFormat>) -> PathBuf {
    let ext = format.map(AudioFormat::as_str).unwrap_or("bin");
    PathBuf::from(format!("{stem}.{ext}"))
}

async fn write_input(path: &std::path::Path, bytes: &[u8]) -> Result<(), TtsError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| TtsError::PostProcess(format!("failed to stage {}: {e}", path.display())))
}
