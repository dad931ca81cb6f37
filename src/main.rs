use anyhow::{bail, Context};
use clap::Parser;
use llama_sut::{
    decode_token_ids, BarProgress, Backend, CompletionSink, HfTokenCodec, Mode, Protocol, Request,
    ResponseId, RetryPolicy, Sut, SutConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drives a remote deployment with a fixed sample set and records what it answered.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; explicit flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream-first-token mode instead of batch-complete
    #[arg(long)]
    server: bool,

    /// Primary inference server (host:port or URL)
    #[arg(long)]
    api_server: Option<String>,

    /// Further servers, comma separated. Needs --api-server.
    #[arg(long, value_delimiter = ',')]
    additional_servers: Vec<String>,

    #[arg(long)]
    api_model_name: Option<String>,

    /// Talk the OpenAI-style completions protocol
    #[arg(long)]
    vllm: bool,

    #[arg(long)]
    grpc: bool,

    #[arg(long)]
    batch_grpc: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    /// tokenizer.json of the served model
    #[arg(long)]
    tokenizer_path: PathBuf,

    #[arg(long, default_value = "</s>")]
    eos_token: String,

    /// JSON array of samples, each with `input_ids`
    #[arg(long)]
    samples: PathBuf,

    /// Where to write per-request results
    #[arg(long)]
    output: Option<PathBuf>,

    /// Replay batches from the output cache when present
    #[arg(long)]
    use_cached_outputs: bool,

    /// Give up on an endpoint call after this many attempts (default: never)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Log to this file instead of stderr (truncated on start)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Sample {
    input_ids: Vec<u32>,
    #[serde(default)]
    attention_mask: Option<Vec<u32>>,
}

#[derive(Debug, Default, Serialize)]
struct SampleResult {
    tokens: Vec<u32>,
    first_token: Option<u32>,
}

#[derive(Default)]
struct ResultSink {
    results: Mutex<BTreeMap<u64, SampleResult>>,
}

impl CompletionSink for ResultSink {
    fn complete(&self, id: ResponseId, data: &[u8], _n_tokens: usize) {
        self.results.lock().entry(id.0).or_default().tokens = decode_token_ids(data);
    }

    fn complete_first_token(&self, id: ResponseId, data: &[u8]) {
        self.results.lock().entry(id.0).or_default().first_token =
            decode_token_ids(data).first().copied();
    }
}

fn init_logging(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<SutConfig> {
    let mut config = match &args.config {
        Some(path) => SutConfig::from_file(path)?,
        None => SutConfig::default(),
    };
    if args.server {
        config.mode = Mode::Server;
    }
    if args.api_server.is_some() {
        config.api_server = args.api_server.clone();
    }
    if !args.additional_servers.is_empty() {
        config.additional_servers = args.additional_servers.clone();
    }
    if args.api_model_name.is_some() {
        config.api_model_name = args.api_model_name.clone();
    }
    config.vllm |= args.vllm;
    config.grpc |= args.grpc;
    config.batch_grpc |= args.batch_grpc;
    if args.batch_size.is_some() {
        config.batch_size = args.batch_size;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.use_cached_outputs |= args.use_cached_outputs;
    if let Some(max_attempts) = args.max_attempts {
        config.retry = RetryPolicy::bounded(max_attempts);
    }
    config.validate()?;
    Ok(config)
}

fn load_samples(path: &PathBuf) -> anyhow::Result<Vec<Request>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read samples {}", path.display()))?;
    let samples: Vec<Sample> = serde_json::from_str(&contents)?;
    Ok(samples
        .into_iter()
        .enumerate()
        .map(|(index, sample)| {
            let mut request = Request::new(ResponseId(index as u64), index, sample.input_ids);
            if let Some(mask) = sample.attention_mask {
                request.attention_mask = mask;
            }
            request
        })
        .collect())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_ref())?;

    let config = build_config(&args)?;
    match config.protocol()? {
        Protocol::Local => bail!("--api-server is required, no in-process model is linked into this binary"),
        Protocol::Rpc { .. } => bail!("grpc endpoints are not supported by this binary"),
        Protocol::TextGeneration | Protocol::Completions => {}
    }

    let codec = Arc::new(HfTokenCodec::from_file(&args.tokenizer_path, args.eos_token.clone())?);
    let backend = Backend::http(&config, codec)?;
    let requests = load_samples(&args.samples)?;
    let total = requests.len();
    info!("loaded {total} samples from {}", args.samples.display());

    let sink = Arc::new(ResultSink::default());
    let progress = Arc::new(BarProgress::new(total));
    let start = Instant::now();
    let mut sut = Sut::start(config, backend, sink.clone(), progress.clone())?;
    sut.submit(requests)?;
    sut.flush();
    let outcome = sut.shutdown();
    progress.finish();
    outcome?;
    info!(
        "{} samples completed in {:.2}s",
        sut.completed_samples(),
        start.elapsed().as_secs_f64()
    );

    if let Some(path) = &args.output {
        let results = sink.results.lock();
        let json = serde_json::to_string_pretty(&*results)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("results written to {}", path.display());
    }
    Ok(())
}
