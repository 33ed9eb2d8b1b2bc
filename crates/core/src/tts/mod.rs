mod basic;
mod http;

use crate::config::{validate_speed, ApiKey, SpeechDefaults};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use basic::ToneSynthesisClient;
#[cfg(test)]
pub(crate) use basic::wav_container;
pub use http::HttpSynthesisClient;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
        }
    }

    /// Maps a response content type to a container, if it names one.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg-3" => Some(Self::Mp3),
            "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => Some(Self::Wav),
            _ => None,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "wav" => Ok(Self::Wav),
            other => Err(format!("unsupported audio format: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct ExtraValue {
    value: Value,
    affects_content: bool,
}

/// Vendor parameters the pipeline does not model explicitly.
///
/// Every entry is forwarded to the provider. Only entries inserted with
/// [`ExtraOptions::insert_content`] change the cache fingerprint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtraOptions {
    values: BTreeMap<String, ExtraValue>,
}

impl ExtraOptions {
    /// Adds a parameter that does not change the rendered audio.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(
            key.into(),
            ExtraValue {
                value,
                affects_content: false,
            },
        );
    }

    /// Adds a parameter that changes the rendered audio.
    pub fn insert_content(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(
            key.into(),
            ExtraValue {
                value,
                affects_content: true,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), &v.value))
    }

    pub fn content_affecting(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values
            .iter()
            .filter(|(_, v)| v.affects_content)
            .map(|(k, v)| (k.as_str(), &v.value))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SpeechOptions {
    pub speed: Option<f32>,
    pub instructions: Option<String>,
    pub extra: ExtraOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub format: AudioFormat,
    pub options: SpeechOptions,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            model: None,
            format: AudioFormat::default(),
            options: SpeechOptions::default(),
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.options.speed = Some(speed);
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.options.instructions = Some(instructions.into());
        self
    }

    /// Fills unset fields from `defaults` and validates the result.
    pub fn resolve(&self, defaults: &SpeechDefaults) -> Result<Self, TtsError> {
        if self.text.trim().is_empty() {
            return Err(TtsError::RequestFailed {
                status: None,
                detail: "text must not be empty".to_owned(),
            });
        }
        let pick = |value: &Option<String>, fallback: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(fallback)
                .to_owned()
        };
        let speed = self.options.speed.unwrap_or(defaults.speed);
        validate_speed(speed).map_err(|e| TtsError::RequestFailed {
            status: None,
            detail: e.to_string(),
        })?;

        Ok(Self {
            text: self.text.trim().to_owned(),
            voice: Some(pick(&self.voice, &defaults.voice)),
            model: Some(pick(&self.model, &defaults.model)),
            format: self.format,
            options: SpeechOptions {
                speed: Some(speed),
                instructions: self
                    .options
                    .instructions
                    .clone()
                    .or_else(|| defaults.instructions.clone()),
                extra: self.options.extra.clone(),
            },
        })
    }
}

/// Raw provider output, before any post-processing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpeechAudio {
    pub bytes: Bytes,
    pub content_type: String,
}

impl SpeechAudio {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Closed classification of request failures.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkFailure,
    AuthExpired,
    InvalidResponse,
    RateLimited,
    RequestFailed,
    PostProcessFailed,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkFailure => "network_failure",
            Self::AuthExpired => "auth_expired",
            Self::InvalidResponse => "invalid_response",
            Self::RateLimited => "rate_limited",
            Self::RequestFailed => "request_failed",
            Self::PostProcessFailed => "post_process_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NetworkFailure | Self::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TtsError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("credentials rejected (HTTP {status}): {detail}")]
    AuthExpired { status: u16, detail: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("rate limited: {detail}")]
    RateLimited {
        retry_after: Option<Duration>,
        detail: String,
    },

    #[error("request failed: {detail}")]
    RequestFailed { status: Option<u16>, detail: String },

    #[error("post-processing failed: {0}")]
    PostProcess(String),

    #[error("{stage} timed out after {}ms", .after.as_millis())]
    Timeout {
        stage: &'static str,
        after: Duration,
    },

    #[error("cancelled")]
    Cancelled,
}

impl TtsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::NetworkFailure,
            Self::AuthExpired { .. } => ErrorKind::AuthExpired,
            Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::RequestFailed { .. } => ErrorKind::RequestFailed,
            Self::PostProcess(_) => ErrorKind::PostProcessFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Supplies the API credential for each attempt. The pipeline never stores
/// or rotates it.
pub trait CredentialSource: Send + Sync {
    fn current(&self) -> Option<ApiKey>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticCredentials(Option<ApiKey>);

impl StaticCredentials {
    pub fn new(key: Option<ApiKey>) -> Self {
        Self(key)
    }
}

impl CredentialSource for StaticCredentials {
    fn current(&self) -> Option<ApiKey> {
        self.0.clone()
    }
}

pub trait SynthesisClient: Send + Sync {
    /// Renders `request`, which has already been resolved against defaults.
    ///
    /// Implementations must return [`TtsError::Cancelled`] promptly once
    /// `cancel` fires.
    fn synthesize<'a>(
        &'a self,
        request: &'a SynthesisRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SpeechAudio, TtsError>>;
}

impl<T: SynthesisClient + ?Sized> SynthesisClient for std::sync::Arc<T> {
    fn synthesize<'a>(
        &'a self,
        request: &'a SynthesisRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SpeechAudio, TtsError>> {
        (**self).synthesize(request, cancel)
    }
}
