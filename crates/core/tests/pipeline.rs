use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tts_relay_core::assemble::{Assembler, PostProcessSpec, StaticAssetProvider};
use tts_relay_core::config::{ApiKey, AssemblerConfig, ClientConfig, PipelineConfig};
use tts_relay_core::pipeline::{ReauthNotifier, SpeechPipeline};
use tts_relay_core::tts::{
    AudioFormat, ErrorKind, HttpSynthesisClient, StaticCredentials, SynthesisRequest,
    ToneSynthesisClient,
};
use tts_relay_core::util::RetryConfig;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MP3_BYTES: &[u8] = b"ID3\x04\x00\x00\x00\x00\x00\x00integration-speech";

#[derive(Default)]
struct CountingNotifier {
    count: AtomicUsize,
}

impl ReauthNotifier for CountingNotifier {
    fn notify(&self, _reason: &str) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

fn assembler() -> Assembler {
    Assembler::new(
        AssemblerConfig {
            ffmpeg_binary: Some("/nonexistent/ffmpeg-for-tests".into()),
            ..AssemblerConfig::default()
        },
        Arc::new(StaticAssetProvider::default()),
    )
}

fn http_client(server: &MockServer) -> HttpSynthesisClient {
    let mut config = ClientConfig::new(&format!("{}/v1/audio/speech", server.uri()))
        .expect("mock url is valid");
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(5),
        rate_limit_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: 0.0,
        ..RetryConfig::default()
    };
    let key = ApiKey::new("integration-key").expect("non-empty");
    HttpSynthesisClient::new(config, Arc::new(StaticCredentials::new(Some(key))))
        .expect("client builds")
}

fn hello() -> SynthesisRequest {
    SynthesisRequest::new("Hello")
        .with_voice("v1")
        .with_model("m1")
        .with_format(AudioFormat::Mp3)
}

#[tokio::test]
async fn concurrent_http_requests_reach_the_vendor_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(MP3_BYTES, "audio/mpeg")
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = SpeechPipeline::new(
        http_client(&server),
        assembler(),
        Arc::new(CountingNotifier::default()),
        PipelineConfig {
            cache_capacity_bytes: 256_000,
            ..PipelineConfig::default()
        },
    )
    .expect("valid config");

    let request = hello();
    let spec = PostProcessSpec::default();
    let results = join_all((0..5).map(|_| pipeline.handle(&request, &spec))).await;
    for result in results {
        assert_eq!(result.expect("clip").bytes.as_ref(), MP3_BYTES);
    }

    // served from cache, still one vendor call
    let again = pipeline.handle(&request, &spec).await.expect("cached clip");
    assert_eq!(again.bytes.as_ref(), MP3_BYTES);

    let stats = pipeline.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.resident_bytes, MP3_BYTES.len() as u64);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn padded_text_is_sent_trimmed_and_shares_the_cache_entry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .and(body_partial_json(serde_json::json!({ "input": "Hello" })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(MP3_BYTES, "audio/mpeg"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = SpeechPipeline::new(
        http_client(&server),
        assembler(),
        Arc::new(CountingNotifier::default()),
        PipelineConfig::default(),
    )
    .expect("valid config");

    let spec = PostProcessSpec::default();
    let padded = SynthesisRequest::new("  Hello \n")
        .with_voice("v1")
        .with_model("m1")
        .with_format(AudioFormat::Mp3);
    let first = pipeline.handle(&padded, &spec).await.expect("clip");
    let second = pipeline.handle(&hello(), &spec).await.expect("cached clip");
    assert_eq!(first, second);
    assert_eq!(pipeline.stats().entries, 1);
}

#[tokio::test]
async fn rejected_credentials_signal_reauth_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_raw(r#"{"error":{"message":"Incorrect API key"}}"#, "application/json")
                .set_delay(Duration::from_millis(20)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let notifier = Arc::new(CountingNotifier::default());
    let pipeline = SpeechPipeline::new(
        http_client(&server),
        assembler(),
        notifier.clone(),
        PipelineConfig::default(),
    )
    .expect("valid config");

    let request = hello();
    let spec = PostProcessSpec::default();
    let (a, b) = tokio::join!(
        pipeline.handle(&request, &spec),
        pipeline.handle(&request, &spec)
    );
    assert_eq!(a.unwrap_err().kind(), ErrorKind::AuthExpired);
    assert_eq!(b.unwrap_err().kind(), ErrorKind::AuthExpired);
    assert_eq!(notifier.count.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.stats().entries, 0);
}

#[tokio::test]
async fn offline_tone_client_round_trip() {
    let tone = Arc::new(ToneSynthesisClient::new());
    let pipeline = SpeechPipeline::new(
        tone.clone(),
        assembler(),
        Arc::new(CountingNotifier::default()),
        PipelineConfig::default(),
    )
    .expect("valid config");

    let request = SynthesisRequest::new("hello there").with_format(AudioFormat::Wav);
    let first = pipeline
        .handle(&request, &PostProcessSpec::default())
        .await
        .expect("clip");
    let second = pipeline
        .handle(&request, &PostProcessSpec::default())
        .await
        .expect("clip");

    assert_eq!(first, second);
    assert_eq!(tone.calls(), 1);
    assert_eq!(first.content_type(), "audio/wav");
    assert_eq!(first.duration, Some(Duration::from_millis(660)));
}

#[tokio::test]
async fn shrinking_capacity_evicts_immediately() {
    let tone = Arc::new(ToneSynthesisClient::new());
    let pipeline = SpeechPipeline::new(
        tone.clone(),
        assembler(),
        Arc::new(CountingNotifier::default()),
        PipelineConfig::default(),
    )
    .expect("valid config");
    let spec = PostProcessSpec::default();
    for text in ["one", "two", "three"] {
        pipeline
            .handle(&SynthesisRequest::new(text).with_format(AudioFormat::Wav), &spec)
            .await
            .expect("clip");
    }
    assert_eq!(pipeline.stats().entries, 3);

    pipeline.configure(0);
    let stats = pipeline.stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.resident_bytes, 0);
    assert_eq!(stats.evictions, 3);
}
