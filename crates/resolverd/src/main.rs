//! resolve - CLI for the supplier-to-registry resolver.
//!
//! One binary, three subcommands: `run` (the full pipeline), `export`
//! (read-only dump of the current checkpoint store), and `retry-errors`
//! (shorthand for `run --retry-errors`), per spec Section 10.4. There is
//! no persistent daemon to control — unlike the teacher's `loopd`/
//! `loopctl` split, there is nothing here that benefits from staying
//! resident between invocations (see DESIGN.md).

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use resolver_core::Config;
use resolverd::coordinator::new_cancel_flag;
use resolverd::registry::FileRegistry;
use resolverd::{export, ingest, llm::LlmAdapter, CheckpointStore, WorkCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "resolve")]
#[command(about = "Resolve noisy supplier records against an official business registry")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest, skip-completed, dispatch, resolve, checkpoint, (optionally) export.
    Run(RunArgs),
    /// Read-only export of the current checkpoint store.
    Export {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Shorthand for `run --retry-errors`.
    RetryErrors(RunArgs),
}

#[derive(Parser, Clone)]
struct RunArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    registry: Option<PathBuf>,
    #[arg(long)]
    fts: Option<PathBuf>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    export: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    retry_errors: bool,
    #[arg(long)]
    model_backed_normalization: Option<bool>,
    #[arg(long)]
    llm_min_interval_ms: Option<u64>,
    /// Base URL for the LLM adapter's HTTP API.
    #[arg(long, default_value = "http://localhost:8080")]
    llm_base_url: String,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let result = runtime.block_on(dispatch(cli.command));
    if let Err(err) = &result {
        error!(error = %err, "resolve exited with an error");
    }
    result
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run(args) => run(args, false).await,
        Command::RetryErrors(args) => run(args, true).await,
        Command::Export { checkpoint, out } => {
            let store = CheckpointStore::open(&checkpoint)
                .await
                .context("opening checkpoint store")?;
            let count = export::export(&store, &out).await.context("exporting")?;
            info!(rows = count, path = %out.display(), "export complete");
            Ok(())
        }
    }
}

fn load_config(args: &RunArgs) -> Result<Config> {
    let mut config = Config::default();

    let config_path = args.config.clone().or_else(|| {
        let sibling = args
            .input
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("resolver.toml");
        sibling.exists().then_some(sibling)
    });
    if let Some(path) = config_path {
        config
            .load_file(&path)
            .with_context(|| format!("loading config file {}", path.display()))?;
    }

    if let Some(w) = args.workers {
        config.workers = w;
    }
    if let Some(b) = args.batch_size {
        config.batch_size = b;
    }
    if args.limit.is_some() {
        config.limit = args.limit;
    }
    config.retry_errors = config.retry_errors || args.retry_errors;
    if let Some(m) = args.model_backed_normalization {
        config.model_backed_normalization = m;
    }
    if let Some(ms) = args.llm_min_interval_ms {
        config.llm_min_interval_ms = ms;
    }
    config.input_path = args.input.clone();
    if let Some(p) = &args.registry {
        config.registry_path = p.clone();
    }
    if let Some(p) = &args.fts {
        config.fts_path = p.clone();
    }
    if let Some(p) = &args.checkpoint {
        config.checkpoint_path = p.clone();
    }
    if let Some(p) = &args.export {
        config.export_path = p.clone();
    }

    Ok(config)
}

async fn run(args: RunArgs, force_retry_errors: bool) -> Result<()> {
    let mut config = load_config(&args)?;
    config.retry_errors = config.retry_errors || force_retry_errors;

    let records = ingest::load(&config.input_path)
        .with_context(|| format!("loading input {}", config.input_path.display()))?;
    info!(count = records.len(), "input loaded");

    let registry = FileRegistry::open(&config.registry_path, &config.fts_path)
        .context("opening registry (builder-provided files missing or unreadable)")?;

    let store = Arc::new(
        CheckpointStore::open(&config.checkpoint_path)
            .await
            .context("opening checkpoint store")?,
    );

    let llm = if config.model_backed_normalization {
        let adapter = LlmAdapter::from_env(&args.llm_base_url, config.llm_min_interval_ms);
        if adapter.is_none() {
            info!("RESOLVER_LLM_API_KEY not set; using heuristic normalizer only");
        }
        adapter.map(Arc::new)
    } else {
        None
    };

    let coordinator = WorkCoordinator::new(
        registry,
        Arc::clone(&store),
        llm,
        config.workers,
        config.batch_size,
        config.model_backed_normalization,
    );

    let cancel = new_cancel_flag();
    let cancel_for_signal = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, draining in-flight work");
            cancel_for_signal.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let summary = coordinator
        .run(records, config.limit, config.retry_errors, &cancel)
        .await
        .context("running resolver pipeline")?;

    info!(
        total = summary.total,
        processed = summary.processed,
        cancelled = summary.cancelled,
        "run complete"
    );

    export::export(&store, &config.export_path)
        .await
        .context("exporting results")?;

    Ok(())
}
