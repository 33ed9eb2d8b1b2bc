use crate::config::AssemblerConfig;
use crate::tts::{AudioFormat, TtsError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STAGE: &str = "post-process";

/// Builds the ffmpeg argument list for one assembly run.
///
/// With a chime, the chime and the speech are each resampled to mono at the
/// configured rate and concatenated chime first. Loudness normalization, when
/// requested, applies to the speech stream only.
pub(crate) fn build_args(
    chime: Option<&Path>,
    speech: &Path,
    normalize: bool,
    target: AudioFormat,
    config: &AssemblerConfig,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect();
    let rate = config.sample_rate_hz;

    match chime {
        Some(chime) => {
            args.push("-i".into());
            args.push(chime.into());
            args.push("-i".into());
            args.push(speech.into());

            let loudnorm = if normalize {
                format!("{},", config.loudnorm_filter)
            } else {
                String::new()
            };
            let graph = format!(
                "[0:a]aresample={rate},aformat=channel_layouts=mono[chime];\
                 [1:a]{loudnorm}aresample={rate},aformat=channel_layouts=mono[speech];\
                 [chime][speech]concat=n=2:v=0:a=1[out]"
            );
            args.push("-filter_complex".into());
            args.push(graph.into());
            args.push("-map".into());
            args.push("[out]".into());
        }
        None => {
            args.push("-i".into());
            args.push(speech.into());
            if normalize {
                args.push("-af".into());
                args.push(config.loudnorm_filter.as_str().into());
            }
        }
    }

    args.push("-vn".into());
    args.push("-ac".into());
    args.push("1".into());
    args.push("-ar".into());
    args.push(rate.to_string().into());
    match target {
        AudioFormat::Mp3 => {
            for a in ["-c:a", "libmp3lame", "-b:a", config.bitrate.as_str(), "-f", "mp3"] {
                args.push(a.into());
            }
        }
        AudioFormat::Wav => {
            for a in ["-c:a", "pcm_s16le", "-f", "wav"] {
                args.push(a.into());
            }
        }
    }
    args.push(output.into());
    args
}

/// Picks the ffmpeg binary: explicit path, then the sidecar location. An
/// optional download is bounded by the process timeout and `cancel`.
pub(crate) async fn resolve_binary(
    config: &AssemblerConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf, TtsError> {
    if let Some(path) = &config.ffmpeg_binary {
        return Ok(path.clone());
    }
    sidecar_binary(config.auto_download_ffmpeg, config.process_timeout, cancel).await
}

#[cfg(feature = "ffmpeg-sidecar")]
async fn sidecar_binary(
    auto_download: bool,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PathBuf, TtsError> {
    if auto_download {
        bounded_download(ffmpeg_sidecar::download::auto_download, timeout, cancel).await?;
    }
    Ok(ffmpeg_sidecar::paths::ffmpeg_path())
}

#[cfg(not(feature = "ffmpeg-sidecar"))]
async fn sidecar_binary(
    _auto_download: bool,
    _timeout: Duration,
    _cancel: &CancellationToken,
) -> Result<PathBuf, TtsError> {
    Ok(PathBuf::from("ffmpeg"))
}

/// Runs a blocking download off the runtime. The caller stops waiting on
/// timeout or cancellation; the blocking thread finishes on its own.
#[cfg(feature = "ffmpeg-sidecar")]
async fn bounded_download<F, E>(
    download: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), TtsError>
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(TtsError::Cancelled);
    }
    let task = tokio::task::spawn_blocking(download);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TtsError::Cancelled),
        joined = tokio::time::timeout(timeout, task) => match joined {
            Err(_) => Err(TtsError::Timeout {
                stage: "ffmpeg-download",
                after: timeout,
            }),
            Ok(Err(e)) => Err(TtsError::PostProcess(format!("ffmpeg download task failed: {e}"))),
            Ok(Ok(Err(e))) => Err(TtsError::PostProcess(format!("ffmpeg unavailable: {e}"))),
            Ok(Ok(Ok(()))) => Ok(()),
        },
    }
}

/// Runs ffmpeg to completion. The child is killed if the run is cancelled,
/// times out, or the future is dropped.
pub(crate) async fn run_ffmpeg(
    binary: &Path,
    args: &[OsString],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), TtsError> {
    let child = tokio::process::Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                TtsError::PostProcess(format!("ffmpeg not found at {}", binary.display()))
            }
            _ => TtsError::PostProcess(format!("failed to spawn ffmpeg: {e}")),
        })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TtsError::Cancelled),
        waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
            Err(_) => {
                return Err(TtsError::Timeout {
                    stage: STAGE,
                    after: timeout,
                })
            }
            Ok(result) => result.map_err(|e| TtsError::PostProcess(e.to_string()))?,
        },
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        return Err(TtsError::PostProcess(format!(
            "exit_code={:?} stderr={stderr}",
            output.status.code()
        )));
    }
    Ok(())
}
