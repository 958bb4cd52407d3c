use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map};
use storybook_contracts::events::JobEventLog;
use storybook_contracts::models::BackendRegistry;
use storybook_contracts::outcome::{JobResult, JobStatus, TaskOutcome};
use storybook_contracts::records::{write_job_record, JobRecord};
use storybook_contracts::request::{GenerationRequest, Style};
use storybook_engine::{
    default_registry, ArtifactCache, EngineConfig, FsObjectStore, JsonMetadataStore,
    MetadataStore, Orchestrator, RateLimiters,
};
use tracing::{info, Level};

#[derive(Debug, Parser)]
#[command(name = "storybook-rs", version, about = "Storybook illustration job runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Illustrate(IllustrateArgs),
    History(HistoryArgs),
    Backends,
}

#[derive(Debug, Parser)]
struct IllustrateArgs {
    #[arg(long)]
    out: PathBuf,
    /// Full request as JSON.
    #[arg(long, conflicts_with = "poem", required_unless_present = "poem")]
    request: Option<PathBuf>,
    /// Plain-text poem; stanzas separated by blank lines.
    #[arg(long)]
    poem: Option<PathBuf>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("storybook-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Illustrate(args) => run_illustrate(args),
        Command::History(args) => {
            run_history(args)?;
            Ok(0)
        }
        Command::Backends => {
            run_backends();
            Ok(0)
        }
    }
}

fn init_logging() {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|raw| parse_log_level(&raw))
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_log_level(raw: &str) -> Option<Level> {
    match raw.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

fn run_illustrate(args: IllustrateArgs) -> Result<i32> {
    let request = load_request(&args)?;
    let config = EngineConfig::load(args.config.as_deref())?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));

    let backends = BackendRegistry::new(None);
    let orchestrator = Orchestrator::new(
        config.clone(),
        default_registry(&backends),
        Arc::new(ArtifactCache::new()),
        RateLimiters::from_config(&config),
    )
    .with_backends(backends)
    .with_object_store(Arc::new(FsObjectStore::new(args.out.join("objects"))))
    .with_metadata_store(Arc::new(JsonMetadataStore::new(args.out.join("metadata"))))
    .with_events(JobEventLog::new(events_path));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(orchestrator.process(&request))?;

    let written = write_illustrations(&args.out.join("illustrations"), &result)?;
    let record_path = args
        .out
        .join("jobs")
        .join(format!("{}.json", result.job_id));
    let mut extra = Map::new();
    extra.insert("illustrations".to_string(), json!(written));
    write_job_record(&record_path, &JobRecord::from_result(&result), Some(&extra))?;
    info!(job_id = %result.job_id, status = result.status.as_str(), "job record written");

    print_summary(&result);
    Ok(exit_code(result.status))
}

fn load_request(args: &IllustrateArgs) -> Result<GenerationRequest> {
    let mut request = match (&args.request, &args.poem) {
        (Some(path), _) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            serde_json::from_str::<GenerationRequest>(&raw)
                .with_context(|| format!("invalid request {}", path.display()))?
        }
        (None, Some(path)) => {
            let poem = fs::read_to_string(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            GenerationRequest::new(poem, Style::default())
        }
        (None, None) => bail!("illustrate requires --request or --poem"),
    };

    if let Some(raw) = args.style.as_deref() {
        let Some(style) = Style::parse(raw) else {
            let known = Style::ALL.map(|style| style.as_str()).join(", ");
            bail!("unknown style '{raw}' (expected one of: {known})");
        };
        request.style = style;
    }
    if let Some(model) = args.model.as_deref() {
        request.model = Some(model.to_string());
    }
    Ok(request)
}

/// Copies every successful artifact to `dir` and returns the written paths.
fn write_illustrations(dir: &Path, result: &JobResult) -> Result<Vec<String>> {
    let mut written = Vec::new();
    for (kind, artifact) in result.artifacts() {
        fs::create_dir_all(dir).with_context(|| format!("failed creating {}", dir.display()))?;
        let bytes = artifact.bytes();
        let path = dir.join(format!("{}.{}", kind.label(), image_extension(bytes)));
        fs::write(&path, bytes)
            .with_context(|| format!("failed writing {}", path.display()))?;
        written.push(path.to_string_lossy().to_string());
    }
    Ok(written)
}

/// File extension for the encoded image, `png` when the format is unknown.
fn image_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("png")
}

fn print_summary(result: &JobResult) {
    println!(
        "job {} [{}] backend={} style={}",
        result.job_id,
        result.status.as_str(),
        result.backend,
        result.style.as_str()
    );
    for task in &result.tasks {
        let detail = match &task.outcome {
            TaskOutcome::Generated(_) => format!("generated after {} attempt(s)", task.attempts),
            TaskOutcome::Cached(_) => "cache hit".to_string(),
            TaskOutcome::Failed(failure) => {
                format!("{} after {} attempt(s): {}", failure.class, task.attempts, failure.message)
            }
        };
        println!("  {:<10} {}", task.kind.label(), detail);
    }
}

fn exit_code(status: JobStatus) -> i32 {
    match status {
        JobStatus::Complete => 0,
        JobStatus::PartialFailure => 2,
        JobStatus::Failed => 1,
    }
}

fn run_history(args: HistoryArgs) -> Result<()> {
    let store = JsonMetadataStore::new(args.out.join("metadata"));
    let jobs = store.recent_jobs(args.limit)?;
    if jobs.is_empty() {
        println!("No jobs recorded under {}", args.out.display());
        return Ok(());
    }
    for job in jobs {
        let failed = job.failed_tasks().count();
        println!(
            "{}  {}  {:<15} {:<12} stanzas={} failed_tasks={}",
            job.finished_at.to_rfc3339(),
            job.job_id,
            job.status.as_str(),
            job.backend,
            job.stanza_count,
            failed
        );
    }
    Ok(())
}

fn run_backends() {
    let registry = BackendRegistry::new(None);
    for spec in registry.list() {
        let sizes: Vec<&str> = spec.sizes.iter().map(|size| size.as_str()).collect();
        let summary = json!({
            "id": spec.id.as_str(),
            "provider": spec.provider,
            "model": spec.model,
            "aliases": spec.aliases,
            "sizes": sizes,
        });
        println!("{summary}");
    }
}
