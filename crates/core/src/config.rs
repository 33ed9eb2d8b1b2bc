use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};
use url::Url;

use crate::util::RetryConfig;

pub const DEFAULT_URL: &str = "https://api.openai.com/v1/audio/speech";
pub const DEFAULT_MODEL: &str = "tts-1";
pub const DEFAULT_VOICE: &str = "shimmer";
pub const DEFAULT_SPEED: f32 = 1.0;
pub const MIN_SPEED: f32 = 0.25;
pub const MAX_SPEED: f32 = 4.0;
pub const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 16 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PROCESS_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FOLLOW_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 24_000;
pub const DEFAULT_BITRATE: &str = "128k";
pub const DEFAULT_LOUDNORM: &str = "loudnorm=I=-16:TP=-1:LRA=5";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_TTS_URL: &str = "TTS_RELAY_URL";
pub const ENV_TTS_VOICE: &str = "TTS_RELAY_VOICE";
pub const ENV_TTS_INSTRUCTIONS: &str = "TTS_RELAY_INSTRUCTIONS";

pub const MODELS: &[&str] = &["tts-1", "tts-1-hd", "gpt-4o-mini-tts"];
pub const VOICES: &[&str] = &[
    "alloy", "ash", "ballad", "coral", "echo", "fable", "onyx", "nova", "sage", "shimmer",
];

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, ConfigError> {
        let v = value.into();
        if v.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        Ok(Self(v))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(**redacted**)")
    }
}

/// Fallback values applied when a call leaves a field unset.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpeechDefaults {
    pub voice: String,
    pub model: String,
    pub speed: f32,
    pub instructions: Option<String>,
}

impl Default for SpeechDefaults {
    fn default() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            speed: DEFAULT_SPEED,
            instructions: None,
        }
    }
}

impl SpeechDefaults {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.voice.trim().is_empty() {
            return Err(ConfigError::EmptyVoice);
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        validate_speed(self.speed)
    }
}

pub fn validate_speed(speed: f32) -> Result<(), ConfigError> {
    if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
        return Err(ConfigError::SpeedOutOfRange(speed));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub url: Url,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl ClientConfig {
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            ..Self::default()
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("request"));
        }
        self.request_timeout = timeout;
        Ok(self)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_URL).unwrap_or_else(|_| unreachable!("default url is valid")),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Explicit ffmpeg binary. When unset the binary is resolved at call time.
    pub ffmpeg_binary: Option<PathBuf>,
    pub auto_download_ffmpeg: bool,
    pub process_timeout: Duration,
    pub sample_rate_hz: u32,
    pub bitrate: String,
    pub loudnorm_filter: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: None,
            auto_download_ffmpeg: false,
            process_timeout: Duration::from_millis(DEFAULT_PROCESS_TIMEOUT_MS),
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            bitrate: DEFAULT_BITRATE.to_owned(),
            loudnorm_filter: DEFAULT_LOUDNORM.to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub cache_capacity_bytes: u64,
    pub follow_timeout: Duration,
    pub defaults: SpeechDefaults,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
            follow_timeout: Duration::from_millis(DEFAULT_FOLLOW_TIMEOUT_MS),
            defaults: SpeechDefaults::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.follow_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("follow"));
        }
        self.defaults.validate()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("api key must not be empty")]
    EmptyApiKey,
    #[error("voice must not be empty")]
    EmptyVoice,
    #[error("model must not be empty")]
    EmptyModel,
    #[error("speed {0} outside {MIN_SPEED}..={MAX_SPEED}")]
    SpeedOutOfRange(f32),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("{0} timeout must be > 0")]
    ZeroTimeout(&'static str),
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_api_key(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Result<Option<ApiKey>, ConfigError> {
    match cli_value {
        Some(v) => Ok(Some(ApiKey::new(v)?)),
        None => match env.var(env_key) {
            Some(v) => Ok(Some(ApiKey::new(v)?)),
            None => Ok(None),
        },
    }
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_cli_takes_precedence_over_env() {
        let env = MapEnv::default().with_var(ENV_OPENAI_API_KEY, "env-key");
        let key = resolve_api_key(Some("cli-key".to_owned()), ENV_OPENAI_API_KEY, &env)
            .expect("valid key")
            .expect("present");
        assert_eq!(key.expose(), "cli-key");
    }

    #[test]
    fn api_key_env_used_when_cli_missing() {
        let env = MapEnv::default().with_var(ENV_OPENAI_API_KEY, "env-key");
        let key = resolve_api_key(None, ENV_OPENAI_API_KEY, &env)
            .expect("valid key")
            .expect("present");
        assert_eq!(key.expose(), "env-key");
    }

    #[test]
    fn api_key_absent_everywhere_is_none() {
        let env = MapEnv::default();
        assert!(resolve_api_key(None, ENV_OPENAI_API_KEY, &env)
            .expect("ok")
            .is_none());
    }

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKey::new("sk-secret").expect("non-empty");
        assert!(!format!("{key:?}").contains("sk-secret"));
    }

    #[test]
    fn blank_api_key_rejected() {
        assert_eq!(ApiKey::new("  "), Err(ConfigError::EmptyApiKey));
    }

    #[test]
    fn resolve_string_with_default_cli_takes_precedence() {
        let env = MapEnv::default().with_var(ENV_TTS_URL, "env");
        let v = resolve_string_with_default(Some("cli".to_owned()), ENV_TTS_URL, &env, "def");
        assert_eq!(v, "cli");
    }

    #[test]
    fn resolve_string_with_default_env_used_when_cli_missing() {
        let env = MapEnv::default().with_var(ENV_TTS_URL, "env");
        let v = resolve_string_with_default(None, ENV_TTS_URL, &env, "def");
        assert_eq!(v, "env");
    }

    #[test]
    fn resolve_string_with_default_default_used_when_both_missing() {
        let env = MapEnv::default();
        let v = resolve_string_with_default(None, ENV_TTS_URL, &env, "def");
        assert_eq!(v, "def");
    }

    #[test]
    fn optional_string_falls_back_to_env() {
        let env = MapEnv::default().with_var(ENV_TTS_INSTRUCTIONS, "whisper");
        assert_eq!(
            resolve_optional_string(None, ENV_TTS_INSTRUCTIONS, &env).as_deref(),
            Some("whisper")
        );
        assert_eq!(
            resolve_optional_string(Some("shout".into()), ENV_TTS_INSTRUCTIONS, &env).as_deref(),
            Some("shout")
        );
        assert!(resolve_optional_string(None, ENV_TTS_VOICE, &env).is_none());
    }

    #[test]
    fn client_config_rejects_non_http_scheme() {
        let err = ClientConfig::new("ftp://example.com/speech").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl(_)));
    }

    #[test]
    fn client_config_accepts_custom_backend() {
        let cfg = ClientConfig::new("http://localhost:8880/v1/audio/speech").expect("valid");
        assert_eq!(cfg.url.port(), Some(8880));
        assert_eq!(
            cfg.request_timeout,
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
    }

    #[test]
    fn speed_bounds_are_inclusive() {
        assert!(validate_speed(MIN_SPEED).is_ok());
        assert!(validate_speed(MAX_SPEED).is_ok());
        assert_eq!(validate_speed(4.5), Err(ConfigError::SpeedOutOfRange(4.5)));
        assert!(validate_speed(0.1).is_err());
    }

    #[test]
    fn default_pipeline_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
