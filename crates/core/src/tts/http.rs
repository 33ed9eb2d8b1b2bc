use crate::assemble::sniff_container;
use crate::config::{ClientConfig, DEFAULT_MODEL, DEFAULT_VOICE};
use crate::tts::{
    CredentialSource, SpeechAudio, SynthesisClient, SynthesisRequest, TtsError,
};
use crate::util::{is_http_retryable, retry_with_backoff, RetryDecision};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "tts::client";
const ERROR_SNIPPET_CHARS: usize = 200;

/// Client for OpenAI-compatible `/audio/speech` endpoints.
#[derive(Clone)]
pub struct HttpSynthesisClient {
    client: Client,
    config: ClientConfig,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpSynthesisClient {
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, TtsError> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| TtsError::Network(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    fn payload(request: &SynthesisRequest) -> Value {
        let mut body = Map::new();
        body.insert(
            "model".into(),
            Value::from(request.model.as_deref().unwrap_or(DEFAULT_MODEL)),
        );
        body.insert("input".into(), Value::from(request.text.as_str()));
        body.insert(
            "voice".into(),
            Value::from(request.voice.as_deref().unwrap_or(DEFAULT_VOICE)),
        );
        body.insert(
            "response_format".into(),
            Value::from(request.format.as_str()),
        );
        if let Some(speed) = request.options.speed {
            body.insert("speed".into(), Value::from(speed));
        }
        if let Some(instructions) = &request.options.instructions {
            body.insert("instructions".into(), Value::from(instructions.as_str()));
        }
        for (key, value) in request.options.extra.iter() {
            if body.contains_key(key) {
                tracing::debug!(target: LOG_TARGET, key, "extra option shadows a core field; ignored");
                continue;
            }
            body.insert(key.to_owned(), value.clone());
        }
        Value::Object(body)
    }

    async fn attempt(&self, body: &Value, attempt: u32) -> Result<SpeechAudio, TtsError> {
        let mut builder = self
            .client
            .post(self.config.url.clone())
            .timeout(self.config.request_timeout)
            .json(body);
        if let Some(key) = self.credentials.current() {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        tracing::debug!(target: LOG_TARGET, attempt, status = status.as_u16(), "tts response");

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &text));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        validate_audio(&content_type, bytes)
    }

    fn transport_error(&self, e: reqwest::Error) -> TtsError {
        if e.is_timeout() {
            TtsError::Timeout {
                stage: "synthesis",
                after: self.config.request_timeout,
            }
        } else {
            TtsError::Network(e.to_string())
        }
    }
}

fn classify(error: &TtsError) -> RetryDecision {
    match error {
        TtsError::Network(_) | TtsError::Timeout { .. } => RetryDecision::Backoff,
        TtsError::RateLimited { retry_after, .. } => RetryDecision::Throttled(*retry_after),
        _ => RetryDecision::Stop,
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> TtsError {
    let code = status.as_u16();
    let detail = format!("HTTP {code}: {}", vendor_message(body));
    match code {
        401 | 403 => TtsError::AuthExpired {
            status: code,
            detail,
        },
        429 => TtsError::RateLimited {
            retry_after,
            detail,
        },
        _ if is_http_retryable(code) => TtsError::Network(detail),
        _ => TtsError::RequestFailed {
            status: Some(code),
            detail,
        },
    }
}

/// Pulls a human readable message out of common vendor error bodies.
fn vendor_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .pointer("/error/message")
            .or_else(|| json.get("error"))
            .or_else(|| json.get("detail"))
            .or_else(|| json.get("message"));
        match message {
            Some(Value::String(s)) => return s.clone(),
            Some(other) if !other.is_null() => return other.to_string(),
            _ => {}
        }
    }
    snippet(body)
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_SNIPPET_CHARS {
        return trimmed.to_owned();
    }
    let cut: String = trimmed.chars().take(ERROR_SNIPPET_CHARS).collect();
    format!("{cut}...")
}

fn validate_audio(content_type: &str, bytes: Bytes) -> Result<SpeechAudio, TtsError> {
    if bytes.is_empty() {
        return Err(TtsError::InvalidResponse("empty audio body".into()));
    }
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime.starts_with("audio/") {
        return Ok(SpeechAudio::new(bytes, mime));
    }
    if mime == "application/octet-stream" || mime.is_empty() {
        if let Some(format) = sniff_container(&bytes) {
            return Ok(SpeechAudio::new(bytes, format.content_type()));
        }
    }
    let preview = String::from_utf8_lossy(&bytes[..bytes.len().min(ERROR_SNIPPET_CHARS)]);
    Err(TtsError::InvalidResponse(format!(
        "expected audio, got {}: {}",
        if mime.is_empty() { "no content type" } else { mime.as_str() },
        vendor_message(&preview)
    )))
}

impl SynthesisClient for HttpSynthesisClient {
    fn synthesize<'a>(
        &'a self,
        request: &'a SynthesisRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SpeechAudio, TtsError>> {
        async move {
            let body = Self::payload(request);
            let started = Instant::now();
            let work = retry_with_backoff(
                &self.config.retry,
                |attempt| self.attempt(&body, attempt),
                classify,
            );

            // Dropping `work` aborts the in-flight connection.
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TtsError::Cancelled),
                result = work => result,
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(audio) => tracing::info!(
                    target: LOG_TARGET,
                    bytes = audio.len(),
                    content_type = %audio.content_type,
                    elapsed_ms,
                    "synthesized speech"
                ),
                Err(e) => tracing::warn!(
                    target: LOG_TARGET,
                    kind = %e.kind(),
                    elapsed_ms,
                    "synthesis failed: {e}"
                ),
            }
            result
        }
        .boxed()
    }
}
