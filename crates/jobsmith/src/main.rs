use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use jobsmith::{
    config::{BackendConfig, Config, defaults::DEFAULT_CONFIG_FILE},
    job_scheduling::{
        FunctionRegistry, JobId, JobResult, JobSchedulingAPI, WorkerKind,
        builtin::register_child_builtins, child_process::serve_stdio,
    },
    triggers::{CronExpression, Trigger, describe_cron},
    utils::logging::{LogTarget, init_logging},
};

#[derive(Parser)]
#[command(name = "jobsmith")]
#[command(version)]
#[command(about = "Job queue and scheduler with pluggable backends and worker pools")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend connection URI (overrides config file)
    #[arg(short = 'b', long, global = true, value_name = "URI")]
    backend: Option<String>,

    /// Log level
    #[arg(short = 'v', long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool with the built-in functions until Ctrl-C
    Worker(WorkerArgs),
    /// Serve jobs over stdin/stdout as a process-pool child
    #[command(hide = true)]
    Child,
    /// Inspect cron expressions
    #[command(subcommand)]
    Cron(CronCommand),
    /// Manage stored schedules
    #[command(subcommand)]
    Schedules(ScheduleCommand),
    /// Inspect and manage jobs
    #[command(subcommand)]
    Jobs(JobCommand),
    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args)]
struct WorkerArgs {
    /// Number of execution slots
    #[arg(short = 'n', long)]
    workers: Option<usize>,

    /// Slot kind
    #[arg(short, long, value_parser = parse_kind)]
    kind: Option<WorkerKind>,

    /// Channels to lease from, in priority order
    #[arg(short, long = "queue", value_name = "CHANNEL")]
    queues: Vec<String>,
}

#[derive(Subcommand)]
enum CronCommand {
    /// Print a cron expression in plain English
    Describe { expr: String },
    /// Print upcoming fire times
    Next {
        expr: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    List,
    Pause(ScheduleTarget),
    Resume(ScheduleTarget),
    Cancel(ScheduleTarget),
    Delete(ScheduleTarget),
}

#[derive(Args)]
struct ScheduleTarget {
    /// Schedule id
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    id: Option<String>,

    /// Apply to every schedule
    #[arg(long)]
    all: bool,
}

#[derive(Subcommand)]
enum JobCommand {
    /// Show a job and its result
    Get {
        id: String,
        /// Block until the job finishes
        #[arg(short, long)]
        wait: bool,
    },
    Cancel { id: String },
    Delete { id: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default configuration file
    Init {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

fn parse_kind(value: &str) -> Result<WorkerKind, String> {
    value
        .parse()
        .map_err(|_| format!("unknown worker kind '{value}' (thread, process, fiber)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Config(ConfigCommand::Init { path }) = &cli.command {
        Config::write_default(path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(uri) = cli.backend {
        config.backend = BackendConfig::from_uri(uri);
    }

    match cli.command {
        Command::Child => {
            init_logging(&config.logging, LogTarget::Stderr)?;
            let functions = FunctionRegistry::new();
            register_child_builtins(&functions);
            serve_stdio(functions).await?;
        }
        Command::Cron(command) => run_cron(command)?,
        Command::Worker(args) => {
            init_logging(&config.logging, LogTarget::Stdout)?;
            run_worker(config, args).await?;
        }
        Command::Schedules(command) => {
            init_logging(&config.logging, LogTarget::Stderr)?;
            let api = JobSchedulingAPI::from_config(&config).await?;
            run_schedules(&api, command).await?;
        }
        Command::Jobs(command) => {
            init_logging(&config.logging, LogTarget::Stderr)?;
            let api = JobSchedulingAPI::from_config(&config).await?;
            run_jobs(&api, command).await?;
        }
        Command::Config(_) => {}
    }
    Ok(())
}

async fn run_worker(mut config: Config, args: WorkerArgs) -> Result<()> {
    if !args.queues.is_empty() {
        config.worker.queues = args.queues;
    }
    if let Some(kind) = args.kind {
        config.worker.default_job_executor = kind;
    }
    let workers = args.workers.unwrap_or(config.worker.num_workers);

    info!("Starting jobsmith worker v{}", env!("CARGO_PKG_VERSION"));
    let api = JobSchedulingAPI::from_config(&config).await?;
    info!(
        "Serving functions: {}",
        api.functions().names().join(", ")
    );
    api.start_worker_pool(workers, false).await?;
    info!("Worker exited");
    Ok(())
}

fn run_cron(command: CronCommand) -> Result<()> {
    match command {
        CronCommand::Describe { expr } => {
            let parsed: CronExpression = expr.parse()?;
            println!("{}", describe_cron(&parsed)?);
        }
        CronCommand::Next { expr, count } => {
            let trigger = Trigger::Cron(expr.parse()?);
            let mut after = chrono::Utc::now();
            for _ in 0..count {
                let Some(next) = trigger.next_fire_time(after) else {
                    break;
                };
                println!("{}", next.to_rfc3339());
                after = next;
            }
        }
    }
    Ok(())
}

async fn run_schedules(api: &JobSchedulingAPI, command: ScheduleCommand) -> Result<()> {
    match command {
        ScheduleCommand::List => {
            for schedule in api.get_schedules().await? {
                let next = schedule
                    .next_fire_time
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    schedule.id,
                    schedule.status,
                    schedule.template.function,
                    next,
                    schedule.trigger.describe()
                );
            }
        }
        ScheduleCommand::Pause(target) => match target.id {
            Some(id) => report(&id, "paused", api.pause_schedule(&id).await?),
            None => println!("Paused {} schedules", api.pause_all().await?),
        },
        ScheduleCommand::Resume(target) => match target.id {
            Some(id) => report(&id, "resumed", api.resume_schedule(&id).await?),
            None => println!("Resumed {} schedules", api.resume_all().await?),
        },
        ScheduleCommand::Cancel(target) => match target.id {
            Some(id) => report(&id, "cancelled", api.cancel_schedule(&id).await?),
            None => println!("Cancelled {} schedules", api.cancel_all().await?),
        },
        ScheduleCommand::Delete(target) => match target.id {
            Some(id) => report(&id, "deleted", api.delete_schedule(&id).await?),
            None => println!("Deleted {} schedules", api.delete_all().await?),
        },
    }
    Ok(())
}

async fn run_jobs(api: &JobSchedulingAPI, command: JobCommand) -> Result<()> {
    match command {
        JobCommand::Get { id, wait } => {
            let job_id: JobId = id.parse()?;
            let job = api
                .get_job(job_id)
                .await?
                .with_context(|| format!("job {job_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            if wait {
                match api.get_job_result(job_id, true).await? {
                    JobResult::Value(value) => println!("{value}"),
                    JobResult::NotReady => println!("not ready"),
                }
            }
        }
        JobCommand::Cancel { id } => {
            let job_id: JobId = id.parse()?;
            report(&id, "cancelled", api.cancel_job(job_id).await?);
        }
        JobCommand::Delete { id } => {
            let job_id: JobId = id.parse()?;
            report(&id, "deleted", api.delete_job(job_id).await?);
        }
    }
    Ok(())
}

fn report(id: &str, action: &str, changed: bool) {
    if changed {
        println!("{id} {action}");
    } else {
        println!("{id} unchanged");
    }
}
