//! Request orchestration: fingerprint, cache lookup, single-flight fetch,
//! then per-call assembly.

use crate::assemble::{Assembler, AudioClip, PostProcessSpec};
use crate::cache::{CacheStats, FetchRole, ResultCache};
use crate::config::{ConfigError, PipelineConfig};
use crate::fingerprint::{fingerprint, CacheKey};
use crate::tts::{SpeechAudio, SynthesisClient, SynthesisRequest, TtsError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "tts::pipeline";
const TEXT_PREVIEW_CHARS: usize = 50;

/// Host hook fired when the provider rejects the credential.
pub trait ReauthNotifier: Send + Sync {
    fn notify(&self, reason: &str);
}

/// Default notifier: records the event in the log and nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReauthNotifier;

impl ReauthNotifier for LogReauthNotifier {
    fn notify(&self, reason: &str) {
        tracing::warn!(target: LOG_TARGET, reason, "credentials need to be refreshed");
    }
}

pub struct SpeechPipeline<C> {
    client: C,
    cache: Arc<ResultCache>,
    assembler: Assembler,
    reauth: Arc<dyn ReauthNotifier>,
    config: PipelineConfig,
}

impl<C: SynthesisClient> SpeechPipeline<C> {
    pub fn new(
        client: C,
        assembler: Assembler,
        reauth: Arc<dyn ReauthNotifier>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            client,
            cache: ResultCache::new(config.cache_capacity_bytes),
            assembler,
            reauth,
            config,
        })
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Adjusts cache capacity; a shrink evicts before this returns.
    pub fn configure(&self, cache_capacity_bytes: u64) {
        self.cache.set_capacity(cache_capacity_bytes);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn handle(
        &self,
        request: &SynthesisRequest,
        spec: &PostProcessSpec,
    ) -> Result<AudioClip, TtsError> {
        self.handle_with_cancel(request, spec, &CancellationToken::new())
            .await
    }

    /// Like [`Self::handle`], but stops at the next suspension point once
    /// `cancel` fires. A cancelled follower leaves the shared fetch running.
    pub async fn handle_with_cancel(
        &self,
        request: &SynthesisRequest,
        spec: &PostProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<AudioClip, TtsError> {
        let started = Instant::now();
        let request = request.resolve(&self.config.defaults)?;
        let key = fingerprint(&request);
        tracing::debug!(
            target: LOG_TARGET,
            key = %key.short(),
            text = %preview(&request.text),
            "handling request"
        );

        let result = match self.speech_for(&request, key, cancel).await {
            Ok(speech) => {
                self.assembler
                    .assemble(&speech, request.format, spec, cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(clip) => tracing::info!(
                target: LOG_TARGET,
                key = %key.short(),
                bytes = clip.bytes.len(),
                elapsed_ms,
                "request completed"
            ),
            Err(e) => tracing::error!(
                target: LOG_TARGET,
                key = %key.short(),
                kind = %e.kind(),
                error = %e,
                elapsed_ms,
                "request failed"
            ),
        }
        result
    }

    async fn speech_for(
        &self,
        request: &SynthesisRequest,
        key: CacheKey,
        cancel: &CancellationToken,
    ) -> Result<SpeechAudio, TtsError> {
        if let Some(entry) = self.cache.get(&key) {
            tracing::debug!(target: LOG_TARGET, key = %key.short(), "cache hit");
            return Ok(entry.audio);
        }

        match self.cache.try_begin_fetch(key) {
            FetchRole::Cached(entry) => Ok(entry.audio),
            FetchRole::Owner(ticket) => {
                let outcome = self.fetch(request, cancel).await;
                if let Err(TtsError::AuthExpired { detail, .. }) = &outcome {
                    self.reauth.notify(detail);
                }
                ticket.resolve(outcome.clone());
                outcome
            }
            FetchRole::Follower(waiter) => {
                let after = self.config.follow_timeout;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TtsError::Cancelled),
                    waited = tokio::time::timeout(after, waiter.wait()) => {
                        waited.unwrap_or(Err(TtsError::Timeout { stage: "follow", after }))
                    }
                }
            }
        }
    }

    async fn fetch(
        &self,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> Result<SpeechAudio, TtsError> {
        match AssertUnwindSafe(self.client.synthesize(request, cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(target: LOG_TARGET, "synthesis client panicked");
                Err(TtsError::RequestFailed {
                    status: None,
                    detail: "synthesis client panicked".to_owned(),
                })
            }
        }
    }
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TEXT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
