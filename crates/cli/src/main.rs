#![deny(warnings)]

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tts_relay_core::assemble::{Assembler, DirectoryAssetProvider, PostProcessSpec};
use tts_relay_core::config::{
    resolve_api_key, resolve_optional_string, resolve_string_with_default, ApiKey, AssemblerConfig,
    ClientConfig, Env, PipelineConfig, StdEnv, DEFAULT_CACHE_CAPACITY_BYTES,
    DEFAULT_MODEL, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_URL, DEFAULT_VOICE, ENV_OPENAI_API_KEY,
    ENV_TTS_INSTRUCTIONS, ENV_TTS_URL, ENV_TTS_VOICE,
};
use tts_relay_core::pipeline::{LogReauthNotifier, SpeechPipeline};
use tts_relay_core::tts::{
    AudioFormat, HttpSynthesisClient, StaticCredentials, SynthesisClient, SynthesisRequest,
    ToneSynthesisClient,
};

#[derive(Parser, Debug)]
#[command(name = "tts-relay")]
#[command(about = "Synthesize speech through a cached, deduplicating TTS pipeline")]
struct Args {
    #[arg(long)]
    text: String,

    #[arg(long)]
    voice: Option<String>,

    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long, default_value = "mp3")]
    format: AudioFormat,

    #[arg(long)]
    speed: Option<f32>,

    #[arg(long)]
    instructions: Option<String>,

    /// Extra vendor parameter as key=json; repeatable.
    #[arg(long = "extra", value_name = "KEY=JSON")]
    extra: Vec<String>,

    #[arg(long)]
    chime: Option<String>,

    #[arg(long, default_value = "chimes")]
    chime_dir: PathBuf,

    #[arg(long)]
    normalize: bool,

    #[arg(long)]
    lenient: bool,

    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY_BYTES)]
    cache_capacity: u64,

    /// Number of times to run the request; repeats are served from cache.
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Render a local tone instead of calling the remote API.
    #[arg(long)]
    offline: bool,

    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    url: Option<String>,

    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    request_timeout_ms: u64,

    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    #[arg(long)]
    download_ffmpeg: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

struct RunConfig {
    request: SynthesisRequest,
    post: PostProcessSpec,
    client: Option<ClientConfig>,
    api_key: Option<ApiKey>,
    assembler: AssemblerConfig,
    pipeline: PipelineConfig,
    chime_dir: PathBuf,
    repeat: u32,
    output: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let env = StdEnv;
    let cfg = build_config(args, &env)?;

    tracing::info!(
        format = %cfg.request.format,
        offline = cfg.client.is_none(),
        repeat = cfg.repeat,
        "config loaded"
    );

    run(cfg).await
}

async fn run(cfg: RunConfig) -> anyhow::Result<()> {
    let client: Arc<dyn SynthesisClient> = match &cfg.client {
        Some(client_cfg) => {
            if cfg.api_key.is_none() {
                tracing::warn!("no api key configured; sending unauthenticated requests");
            }
            Arc::new(HttpSynthesisClient::new(
                client_cfg.clone(),
                Arc::new(StaticCredentials::new(cfg.api_key.clone())),
            )?)
        }
        None => Arc::new(ToneSynthesisClient::new()),
    };

    let assembler = Assembler::new(
        cfg.assembler.clone(),
        Arc::new(DirectoryAssetProvider::new(&cfg.chime_dir)),
    );
    let pipeline = SpeechPipeline::new(
        client,
        assembler,
        Arc::new(LogReauthNotifier),
        cfg.pipeline.clone(),
    )?;

    let mut last = None;
    for iteration in 1..=cfg.repeat {
        let started = Instant::now();
        let clip = pipeline
            .handle(&cfg.request, &cfg.post)
            .await
            .map_err(|e| {
                let kind = e.kind();
                anyhow::Error::new(e).context(format!("synthesis failed [{kind}]"))
            })?;
        tracing::info!(
            iteration,
            bytes = clip.bytes.len(),
            duration_ms = clip.duration.map(|d| d.as_millis() as u64),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "clip ready"
        );
        last = Some(clip);
    }

    let stats = pipeline.stats();
    tracing::info!(stats = %serde_json::to_string(&stats)?, "cache stats");

    if let Some(clip) = last {
        tokio::fs::write(&cfg.output, &clip.bytes)
            .await
            .with_context(|| format!("failed to write {}", cfg.output.display()))?;
        tracing::info!(path = %cfg.output.display(), content_type = clip.content_type(), "wrote clip");
    }
    Ok(())
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn build_config(args: Args, env: &impl Env) -> anyhow::Result<RunConfig> {
    anyhow::ensure!(args.repeat > 0, "--repeat must be at least 1");

    let voice = resolve_string_with_default(args.voice, ENV_TTS_VOICE, env, DEFAULT_VOICE);
    let instructions = resolve_optional_string(args.instructions, ENV_TTS_INSTRUCTIONS, env);

    let mut request = SynthesisRequest::new(args.text)
        .with_voice(voice)
        .with_model(args.model)
        .with_format(args.format);
    request.options.speed = args.speed;
    request.options.instructions = instructions;
    for raw in &args.extra {
        let (key, value) = parse_extra(raw)?;
        request.options.extra.insert_content(key, value);
    }

    let post = PostProcessSpec {
        chime_enabled: args.chime.is_some(),
        chime_asset: args.chime,
        normalize: args.normalize,
        lenient: args.lenient,
    };

    let api_key = resolve_api_key(args.api_key, ENV_OPENAI_API_KEY, env)?;
    let client = if args.offline {
        None
    } else {
        let url = resolve_string_with_default(args.url, ENV_TTS_URL, env, DEFAULT_URL);
        Some(
            ClientConfig::new(&url)?
                .with_request_timeout(Duration::from_millis(args.request_timeout_ms))?,
        )
    };

    let assembler = AssemblerConfig {
        ffmpeg_binary: args.ffmpeg,
        auto_download_ffmpeg: args.download_ffmpeg,
        ..AssemblerConfig::default()
    };

    let pipeline = PipelineConfig {
        cache_capacity_bytes: args.cache_capacity,
        ..PipelineConfig::default()
    };
    pipeline.validate()?;

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("speech.{}", request.format)));

    Ok(RunConfig {
        request,
        post,
        client,
        api_key,
        assembler,
        pipeline,
        chime_dir: args.chime_dir,
        repeat: args.repeat,
        output,
    })
}

/// Splits `key=value`; the value is JSON when it parses, a string otherwise.
fn parse_extra(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("--extra expects KEY=JSON, got {raw:?}"))?;
    let key = key.trim();
    anyhow::ensure!(!key.is_empty(), "--extra key must not be empty");
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}
