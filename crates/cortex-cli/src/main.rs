//! cortex: stream a chat reply or drive indexing jobs from a terminal.
//!
//! Connection settings come from the environment (`CORTEX_API_URL`,
//! `CORTEX_API_TOKEN`, ...; a `.env` file is honoured). Job state is kept in
//! a JSON state file so jobs started by one invocation can be followed or
//! cancelled by the next.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use cortex_core::logging::{self, LoggingConfig};
use cortex_core::{defaults, ApiConfig, EventBus, JobEvent, JobId, JsonFileStore, TargetSpec};
use cortex_jobs::{
    CoordinatorConfig, HttpJobClient, JobCoordinator, JobLedger, JobPoller, PollerConfig,
    TimerRegistry,
};
use cortex_stream::{HttpChatTransport, StreamCallbacks, StreamingSession};

#[derive(Parser)]
#[command(name = "cortex")]
#[command(author, version, about = "Streaming chat and indexing jobs for cortex")]
#[command(propagate_version = true)]
struct Cli {
    /// State file holding in-flight jobs
    #[arg(long, env = "CORTEX_STATE_FILE", default_value = defaults::STATE_FILE, global = true)]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and stream the reply to stdout
    Chat {
        /// Conversation the message belongs to
        #[arg(short, long)]
        conversation: String,

        /// Message text
        message: String,
    },

    /// Manage indexing jobs
    #[command(subcommand)]
    Index(IndexCommands),
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Start indexing one target or all configured targets
    Start {
        #[command(flatten)]
        target: TargetArgs,

        /// Follow the jobs until they finish
        #[arg(short, long)]
        wait: bool,
    },

    /// Show active jobs
    Status,

    /// Cancel a job
    Cancel {
        /// Server-assigned job id
        job_id: String,
    },

    /// Resume tracking of jobs recorded in the state file
    Resume {
        /// Follow the jobs until they finish
        #[arg(short, long)]
        wait: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Target to index
    #[arg(short, long)]
    target: Option<String>,

    /// Index every configured target
    #[arg(short, long)]
    all: bool,
}

impl TargetArgs {
    fn spec(&self) -> TargetSpec {
        match self.target {
            Some(ref target) => TargetSpec::single(target.as_str()),
            None => TargetSpec::All,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    logging::init(&LoggingConfig::from_env());

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Chat {
            conversation,
            message,
        } => chat(&conversation, &message).await,
        Commands::Index(command) => {
            let coordinator = coordinator(&cli.state).await?;
            let result = index(&coordinator, command).await;
            coordinator.shutdown();
            result
        }
    }
}

async fn chat(conversation: &str, message: &str) -> anyhow::Result<()> {
    let transport = HttpChatTransport::new(ApiConfig::from_env())?;
    let session = Arc::new(StreamingSession::new(Arc::new(transport)));

    let callbacks = StreamCallbacks::new().on_token(|token| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(token.as_bytes());
        let _ = stdout.flush();
    });

    let turn = session.begin(conversation, message, callbacks);
    tokio::pin!(turn);

    let result = tokio::select! {
        result = &mut turn => result,
        _ = tokio::signal::ctrl_c() => {
            session.cancel();
            turn.await
        }
    };
    println!();

    match result {
        Ok(_) => Ok(()),
        Err(cortex_core::Error::RateLimited { retry_after, .. }) => match retry_after {
            Some(delay) => bail!("rate limited, retry in {}s", delay.as_secs()),
            None => bail!("rate limited, retry later"),
        },
        Err(e) => Err(e).context("chat stream failed"),
    }
}

/// Open the job coordinator, pruning ledger entries of finished jobs.
async fn coordinator(state: &Path) -> anyhow::Result<JobCoordinator> {
    let store = JsonFileStore::open(state)
        .with_context(|| format!("cannot open state file {}", state.display()))?;
    debug!(path = %store.path().display(), "Opened state file");

    let transport = Arc::new(HttpJobClient::new(ApiConfig::from_env())?);
    let ledger = JobLedger::new(Arc::new(store));
    let events = EventBus::default();
    let poller = JobPoller::new(
        transport.clone(),
        ledger.clone(),
        Arc::new(TimerRegistry::new()),
        events.clone(),
        PollerConfig::from_env(),
    );
    JobCoordinator::open(
        transport,
        ledger,
        poller,
        events,
        CoordinatorConfig::from_env(),
    )
    .await
    .context("cannot reconcile job ledger")
}

async fn index(coordinator: &JobCoordinator, command: IndexCommands) -> anyhow::Result<()> {
    match command {
        IndexCommands::Start { target, wait } => {
            let mut events = coordinator.events().subscribe();
            let report = coordinator.start(target.spec()).await?;
            for job in &report.jobs {
                println!("started {} on {} ({})", job.job_id, job.target, job.status);
            }
            for failure in &report.failures {
                eprintln!("failed to start {}: {}", failure.target, failure.error);
            }
            if wait {
                let ids = report.jobs.iter().map(|j| j.job_id.clone()).collect();
                follow(coordinator, &mut events, ids).await?;
            }
            Ok(())
        }
        IndexCommands::Status => {
            let jobs = coordinator.resume().await?;
            if jobs.is_empty() {
                println!("no active jobs");
            }
            for job in jobs {
                println!(
                    "{}\t{}\t{}\t{}%",
                    job.job_id, job.target, job.status, job.progress
                );
            }
            Ok(())
        }
        IndexCommands::Cancel { job_id } => {
            let outcome = coordinator.cancel_job(&JobId::new(job_id)).await?;
            if outcome.server_acknowledged {
                println!(
                    "cancelled {}: {}",
                    outcome.job_id,
                    outcome.message.as_deref().unwrap_or("ok")
                );
            } else {
                println!(
                    "cancelled {} locally; server did not confirm ({})",
                    outcome.job_id,
                    outcome.message.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
        IndexCommands::Resume { wait } => {
            let mut events = coordinator.events().subscribe();
            let jobs = coordinator.resume().await?;
            println!("resumed {} job(s)", jobs.len());
            if wait {
                let ids = jobs.into_iter().map(|j| j.job_id).collect();
                follow(coordinator, &mut events, ids).await?;
            }
            Ok(())
        }
    }
}

/// Print job events until every job in `pending` has stopped being tracked.
async fn follow(
    coordinator: &JobCoordinator,
    events: &mut tokio::sync::broadcast::Receiver<JobEvent>,
    mut pending: HashSet<JobId>,
) -> anyhow::Result<()> {
    let mut failed = 0usize;
    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                println!("stopped following; jobs keep running (cortex index resume --wait)");
                return Ok(());
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event receiver lagged");
                pending.retain(|id| coordinator.poller().is_tracking(id));
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            JobEvent::Progress {
                job_id,
                status,
                progress,
            } if pending.contains(&job_id) => {
                println!("{job_id}: {status} {progress}%");
            }
            JobEvent::Completed {
                job_id,
                target,
                status,
                errors,
            } if pending.remove(&job_id) => {
                println!("{job_id}: {target} {status}");
                for error in errors {
                    println!("  {error}");
                }
            }
            JobEvent::Failed {
                job_id,
                target,
                errors,
            } if pending.remove(&job_id) => {
                failed += 1;
                println!("{job_id}: {target} failed");
                for error in errors {
                    println!("  {error}");
                }
            }
            JobEvent::Cancelled { job_id, target } if pending.remove(&job_id) => {
                println!("{job_id}: {target} cancelled");
            }
            JobEvent::Expired { job_id, target } if pending.remove(&job_id) => {
                failed += 1;
                println!("{job_id}: {target} stopped tracking (time limit reached)");
            }
            _ => {}
        }
    }

    if failed > 0 {
        bail!("{failed} job(s) did not complete");
    }
    Ok(())
}
