use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use jobmill::backend::{BackendRegistry, LocalBackend};
use jobmill::config::MillConfig;
use jobmill::coordinator::{Coordinator, NoCredential};
use jobmill::model::{Job, JobId, PluginRegistry};
use jobmill::monitor::MonitoringLoop;
use jobmill::pool::WorkerPool;
use jobmill::registry::Registry;
use jobmill::repository::FileRepository;
use jobmill::shutdown::install_shutdown_handler;
use jobmill::MillError;

#[derive(Parser, Debug)]
#[command(name = "jobmill")]
#[command(version)]
#[command(about = "A local job management mill with pluggable backends")]
#[command(propagate_version = true)]
struct Args {
    /// Repository root directory
    #[arg(long, short = 'r', default_value = "jobmill-repo", global = true)]
    repo: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Job management commands
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run the monitoring loop until interrupted
    Monitor(MonitorArgs),
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create and submit a new job
    Submit {
        /// Executable to run (e.g., "/bin/echo")
        exe: String,

        /// Arguments for the executable
        args: Vec<String>,

        /// Job name
        #[arg(long, default_value = "job")]
        name: String,

        /// Split into this many subjobs before submission
        #[arg(long)]
        split: Option<u32>,
    },
    /// Show one job, including its subjobs
    Status {
        /// The job ID
        job_id: u32,
    },
    /// List all jobs from the repository index
    List,
    /// Kill a job and its subjobs
    Kill {
        /// The job ID
        job_id: u32,
    },
    /// Resubmit a failed or killed job
    Resubmit {
        /// The job ID
        job_id: u32,
    },
    /// Remove a job from the repository
    Remove {
        /// The job ID
        job_id: u32,
    },
}

#[derive(Parser, Debug)]
struct MonitorArgs {
    /// Poll interval in seconds
    #[arg(long, default_value = "30")]
    interval: u64,

    /// Worker pool size
    #[arg(long, default_value = "4")]
    workers: usize,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: u32,
    status: String,
    subjobs: usize,
}

#[derive(Serialize)]
struct SubjobStatusOutput {
    id: String,
    status: String,
    fail_reason: Option<String>,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: u32,
    name: String,
    status: String,
    backend: String,
    resubmit_count: u32,
    fail_reason: Option<String>,
    subjobs: Vec<SubjobStatusOutput>,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: u32,
    name: String,
    status: String,
    modified: String,
}

// =============================================================================
// Context
// =============================================================================

struct Context {
    registry: Arc<Registry>,
    backends: Arc<BackendRegistry>,
    config: MillConfig,
}

async fn open_context(repo_root: &PathBuf) -> Result<Context, Box<dyn std::error::Error>> {
    let config = MillConfig::new(repo_root);
    let plugins = Arc::new(PluginRegistry::with_builtins());
    let repo = Arc::new(FileRepository::open(&config.repository, plugins.clone()).await?);

    let mut backends = BackendRegistry::new();
    backends.register(Arc::new(LocalBackend::new()));
    let backends = Arc::new(backends);

    let registry = Arc::new(Registry::new(
        repo,
        plugins.clone(),
        backends.clone(),
        config.max_resubmits,
    ));
    let load_errors = registry.load().await?;
    for e in &load_errors {
        tracing::warn!(path = %e.path, reason = %e.reason, "Record loaded with errors");
    }

    Ok(Context {
        registry,
        backends,
        config,
    })
}

fn build_job(
    ctx: &Context,
    name: String,
    exe: String,
    args: Vec<String>,
) -> Result<Job, Box<dyn std::error::Error>> {
    let application = ctx
        .registry
        .plugins()
        .build("applications", "Executable")
        .ok_or_else(|| MillError::UnknownPlugin {
            category: "applications".into(),
            type_name: "Executable".into(),
        })?
        .with_field("exe", json!(exe))
        .with_field("args", json!(args));
    let backend = ctx
        .registry
        .plugins()
        .build("backends", "Local")
        .ok_or_else(|| MillError::UnknownPlugin {
            category: "backends".into(),
            type_name: "Local".into(),
        })?;
    Ok(Job::new(name, application, backend))
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_submit(
    ctx: &Context,
    name: String,
    exe: String,
    args: Vec<String>,
    split: Option<u32>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = build_job(ctx, name, exe, args)?;
    let id = ctx.registry.add(job).await?;
    if let Some(count) = split {
        ctx.registry.split(id, count).await?;
    }
    ctx.registry.submit(id).await?;
    let job = ctx.registry.get(id).await?;

    match output {
        OutputFormat::Json => {
            let out = JobSubmitOutput {
                job_id: id.value(),
                status: job.status.as_str().to_string(),
                subjobs: job.subjobs.len(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Job {} submitted ({})", id, job.status.as_str());
            if !job.subjobs.is_empty() {
                println!("Subjobs: {}", job.subjobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_status(
    ctx: &Context,
    job_id: u32,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = ctx.registry.get(JobId::new(job_id)).await?;
    match output {
        OutputFormat::Json => {
            let out = JobStatusOutput {
                job_id: job.id.value(),
                name: job.name.clone(),
                status: job.status.as_str().to_string(),
                backend: job.backend.type_name.clone(),
                resubmit_count: job.resubmit_count,
                fail_reason: job.fail_reason.clone(),
                subjobs: job
                    .subjobs
                    .iter()
                    .map(|s| SubjobStatusOutput {
                        id: format!("{}.{}", job.id, s.id.value()),
                        status: s.status.as_str().to_string(),
                        fail_reason: s.fail_reason.clone(),
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Job ID:    {}", job.id);
            println!("Name:      {}", job.name);
            println!("Status:    {}", job.status.as_str());
            println!("Backend:   {}", job.backend.type_name);
            if job.resubmit_count > 0 {
                println!("Resubmits: {}", job.resubmit_count);
            }
            if let Some(reason) = &job.fail_reason {
                println!("Failure:   {}", reason);
            }
            if !job.subjobs.is_empty() {
                println!();
                println!("{:<10} {:<14} FAILURE", "SUBJOB", "STATUS");
                println!("{}", "-".repeat(40));
                for sub in &job.subjobs {
                    println!(
                        "{:<10} {:<14} {}",
                        format!("{}.{}", job.id, sub.id.value()),
                        sub.status.as_str(),
                        sub.fail_reason.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_list(
    ctx: &Context,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = ctx.registry.list().await;
    match output {
        OutputFormat::Json => {
            let items: Vec<JobListItem> = entries
                .iter()
                .map(|e| JobListItem {
                    job_id: e.id.value(),
                    name: e.name.clone(),
                    status: e.status.as_str().to_string(),
                    modified: e.modified.to_rfc3339(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Table => {
            if entries.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<8} {:<20} {:<14} MODIFIED", "JOB ID", "NAME", "STATUS");
            println!("{}", "-".repeat(68));
            for e in &entries {
                println!(
                    "{:<8} {:<20} {:<14} {}",
                    e.id.to_string(),
                    e.name,
                    e.status.as_str(),
                    e.modified.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

async fn run_monitor(
    ctx: Context,
    args: MonitorArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ctx.config.clone();
    config.monitoring.poll_interval = Duration::from_secs(args.interval);
    config.pool.workers = args.workers;

    let pool = Arc::new(WorkerPool::new(&config.pool));
    let coordinator = Arc::new(Coordinator::new(
        ctx.registry.clone(),
        pool.clone(),
        Arc::new(NoCredential),
        config.repository.root.clone(),
        config.repository.min_free_bytes,
    ));
    let monitoring = Arc::new(MonitoringLoop::new(
        ctx.registry.clone(),
        pool.clone(),
        ctx.backends.clone(),
        coordinator,
        config.monitoring.clone(),
    ));

    monitoring.start().await;
    let shutdown = install_shutdown_handler();
    shutdown.wait().await;

    monitoring.stop().await;
    pool.shutdown().await;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let ctx = open_context(&args.repo).await?;

    match args.command {
        Commands::Job { command } => match command {
            JobCommands::Submit {
                exe,
                args: job_args,
                name,
                split,
            } => handle_submit(&ctx, name, exe, job_args, split, &args.output).await?,
            JobCommands::Status { job_id } => handle_status(&ctx, job_id, &args.output).await?,
            JobCommands::List => handle_list(&ctx, &args.output).await?,
            JobCommands::Kill { job_id } => {
                ctx.registry.kill(JobId::new(job_id)).await?;
                println!("Job {} killed", job_id);
            }
            JobCommands::Resubmit { job_id } => {
                ctx.registry.resubmit(JobId::new(job_id)).await?;
                println!("Job {} resubmitted", job_id);
            }
            JobCommands::Remove { job_id } => {
                ctx.registry.remove(JobId::new(job_id)).await?;
                println!("Job {} removed", job_id);
            }
        },
        Commands::Monitor(monitor_args) => run_monitor(ctx, monitor_args).await?,
    }

    Ok(())
}
