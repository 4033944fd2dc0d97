//! # siftctl
//!
//! Worker process and operator commands for Sift batch-analysis sweeps.
//!
//! - `siftctl worker` serves the analysis queues until SIGTERM/Ctrl+C
//! - `siftctl sweep` plans the ledger and queues the next pending batch
//! - `siftctl status|pause|resume|stop <job>` inspect and steer a run
//! - `siftctl overview|reset` inspect and reset the batch ledger
//! - `siftctl workers list|start|stop` manage worker processes

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use sift_core::liveness::WorkerSelector;
use sift_core::{
    DocumentId, EntityId, JobId, QueueWorker, SweepFilter, SweepOrchestrator, SweepRequest,
};
use siftctl::{AppConfig, ConfigLoader, ConfigLoaderOptions, Requirements, build_orchestrator};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "siftctl")]
#[command(about = "Resumable batch-analysis sweeps: workers, batches and job control")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// Path to sift.toml (defaults to ./sift.toml or ./config/sift.toml)
    #[arg(long, global = true, env = "SIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Coordination store URL (overrides config)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Corpus JSON file (overrides config)
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// Analyzer endpoint (overrides config)
    #[arg(long, global = true)]
    analyzer_url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve analysis queues until SIGTERM or Ctrl+C
    Worker(WorkerArgs),
    /// Queue the next pending (else incomplete) batch
    Sweep {
        #[command(flatten)]
        sweep: SweepArgs,
        /// Run queued batches in this process until the queue is empty
        #[arg(long, default_value_t = false)]
        drain: bool,
    },
    /// Queue a specific batch by number
    StartBatch {
        /// 1-based batch number
        batch: u32,
        #[command(flatten)]
        sweep: SweepArgs,
    },
    /// Print a job's status record
    Status { job_id: JobId },
    /// Ask a running job to pause before its next entity
    Pause { job_id: JobId },
    /// Resume a paused job
    Resume { job_id: JobId },
    /// Ask a job to stop before its next entity
    Stop { job_id: JobId },
    /// Print the batch ledger for a filter
    Overview {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Return every batch to pending
    Reset,
    /// Manage worker processes
    #[command(subcommand)]
    Workers(WorkersCommand),
}

#[derive(ClapArgs, Debug, Clone)]
struct WorkerArgs {
    /// Queues to serve, in priority order (comma-separated)
    #[arg(long, value_delimiter = ',')]
    queues: Vec<String>,

    /// Exit once the queues are empty instead of polling forever
    #[arg(long, default_value_t = false)]
    drain: bool,
}

#[derive(Debug, Subcommand)]
enum WorkersCommand {
    /// List live workers (stale records are reaped)
    List,
    /// Launch a detached worker process
    Start {
        /// Queues to serve (comma-separated)
        #[arg(long, value_delimiter = ',')]
        queues: Vec<String>,
    },
    /// Terminate registered workers on this host and purge their records
    Stop {
        /// Only workers serving this queue
        #[arg(long)]
        queue: Option<String>,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct FilterArgs {
    /// Restrict to these entity ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    entities: Vec<i64>,

    /// Restrict to these document ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    documents: Vec<i64>,
}

impl FilterArgs {
    fn to_filter(&self) -> SweepFilter {
        let mut filter = SweepFilter::all();
        if !self.entities.is_empty() {
            filter = filter.with_entities(self.entities.iter().copied().map(EntityId));
        }
        if !self.documents.is_empty() {
            filter = filter.with_documents(self.documents.iter().copied().map(DocumentId));
        }
        filter
    }
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct SweepArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Analyze every entity even when its content is unchanged
    #[arg(long, default_value_t = false)]
    force_refresh: bool,

    /// Queue the next batch whenever one completes
    #[arg(long, default_value_t = false)]
    auto_continue: bool,
}

impl SweepArgs {
    fn to_request(&self) -> SweepRequest {
        SweepRequest::new(self.filter.to_filter())
            .force_refresh(self.force_refresh)
            .auto_continue(self.auto_continue)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.global)?;
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration loaded");
    }

    let needs = match &cli.command {
        Command::Worker(_) => Requirements::EXECUTION,
        Command::Sweep { drain: true, .. } => Requirements::EXECUTION,
        Command::Sweep { .. } | Command::StartBatch { .. } | Command::Overview { .. } => {
            Requirements::PLANNING
        }
        Command::Status { .. }
        | Command::Pause { .. }
        | Command::Resume { .. }
        | Command::Stop { .. }
        | Command::Reset
        | Command::Workers(_) => Requirements::CONTROL,
    };
    let orchestrator = build_orchestrator(&config, needs).await?;

    match cli.command {
        Command::Worker(args) => run_worker(orchestrator, &config, args.queues, args.drain).await,
        Command::Sweep { sweep, drain } => {
            let job = orchestrator
                .queue_batch_sweep(&sweep.to_request())
                .await
                .context("failed to queue sweep")?;
            print_job(job);
            if drain && job.is_some() {
                run_worker(orchestrator, &config, Vec::new(), true).await?;
            }
            Ok(())
        }
        Command::StartBatch { batch, sweep } => {
            let job = orchestrator
                .start_batch(batch, &sweep.to_request())
                .await
                .with_context(|| format!("failed to start batch {batch}"))?;
            print_job(job);
            Ok(())
        }
        Command::Status { job_id } => {
            let status = orchestrator.get_job_status(job_id).await?;
            print_json(&status)
        }
        Command::Pause { job_id } => {
            orchestrator.pause(job_id).await?;
            println!("pause requested for {job_id}");
            Ok(())
        }
        Command::Resume { job_id } => {
            orchestrator.resume(job_id).await?;
            println!("resume requested for {job_id}");
            Ok(())
        }
        Command::Stop { job_id } => {
            orchestrator.stop(job_id).await?;
            println!("stop requested for {job_id}");
            Ok(())
        }
        Command::Overview { filter } => {
            let overview = orchestrator
                .get_batch_overview(&filter.to_filter())
                .await
                .context("failed to build batch overview")?;
            print_json(&overview)
        }
        Command::Reset => {
            let reset = orchestrator.reset_batches().await?;
            println!("reset {reset} batches");
            Ok(())
        }
        Command::Workers(WorkersCommand::List) => {
            let workers = orchestrator.list_active_workers().await?;
            print_json(&workers)
        }
        Command::Workers(WorkersCommand::Start { queues }) => {
            let pid = orchestrator
                .start_worker(&queues)
                .await
                .context("failed to launch worker")?;
            println!("worker started (pid {pid})");
            Ok(())
        }
        Command::Workers(WorkersCommand::Stop { queue }) => {
            let selector = match queue {
                Some(queue) => WorkerSelector::Queue(queue),
                None => WorkerSelector::All,
            };
            let report = orchestrator.stop_all_workers(&selector).await?;
            print_json(&report)
        }
    }
}

fn load_config(args: &GlobalArgs) -> anyhow::Result<AppConfig> {
    let loader = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    });
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(url) = &args.redis_url {
        config.redis_url = Some(url.clone());
    }
    if let Some(path) = &args.corpus {
        config.corpus_path = path.clone();
    }
    if let Some(url) = &args.analyzer_url {
        config.analyzer.url = Some(url.clone());
    }
    Ok(config)
}

async fn run_worker(
    orchestrator: SweepOrchestrator,
    config: &AppConfig,
    queues: Vec<String>,
    drain: bool,
) -> anyhow::Result<()> {
    let worker = QueueWorker::new(orchestrator, queues, &config.sift);
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    let signals = tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown().await {
            tracing::warn!(error = %err, "failed to listen for shutdown signals");
            return;
        }
        info!("shutdown signal received - finishing current entity");
        signal_token.cancel();
    });

    let stats = if drain {
        worker.drain(shutdown.clone()).await
    } else {
        worker.run(shutdown.clone()).await
    };
    signals.abort();

    let stats = stats.context("worker failed")?;
    info!(
        jobs_run = stats.jobs_run,
        jobs_failed = stats.jobs_failed,
        "worker exited"
    );
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}

fn print_job(job: Option<JobId>) {
    match job {
        Some(job_id) => println!("{job_id}"),
        None => println!("no pending batches"),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered =
        serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
