use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use ink_core::config::{Settings, resolve_path};
use ink_core::logging;
use ink_core::models::{
    BackendOptions, CondorOptions, CoreError, CoreErrorKind, CoreResult, JobFilter, JobSpec,
    SlurmOptions,
};
use ink_core::reconcile::TickOutcome;
use ink_core::service::JobService;
use ink_core::sqlite::{SqliteStore, current_schema_version};
use serde::Serialize;
use serde_json::json;

#[derive(Parser)]
#[command(name = "ink")]
#[command(about = "Submit, track and reconcile jobs on Slurm and HTCondor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Config file (defaults to $INK_CONFIG_FILE, then /etc/ink/config.toml)")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase verbosity level (-v for debug, -vv for trace)")]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Stage a job directory and submit the job")]
    Submit(SubmitArgs),
    #[command(about = "List a user's jobs and reconcile them with the job store")]
    Query(QueryArgs),
    #[command(about = "Cancel a job and close its gateway rule")]
    Cancel(JobArgs),
    #[command(about = "Print a job's stdout and stderr")]
    Output(JobArgs),
    #[command(about = "Print how to reach an interactive job")]
    Connect(JobArgs),
    #[command(about = "Run the HTCondor reconciliation tasks")]
    Reconcile {
        #[command(subcommand)]
        mode: ReconcileMode,
    },
    #[command(about = "Bring the job store schema up to date")]
    Migrate,
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(long, help = "Account the job runs as")]
    user: String,
    #[arg(long)]
    job_type: String,
    #[arg(long)]
    job_name: Option<String>,
    #[arg(long, default_value_t = 1)]
    cpu: u32,
    #[arg(long, help = "Memory in MB")]
    mem: u64,
    #[arg(long, default_value_t = 0)]
    gpu: u32,
    #[arg(long)]
    arguments: Option<String>,
    #[command(subcommand)]
    backend: SubmitBackend,
}

#[derive(Subcommand)]
enum SubmitBackend {
    Slurm {
        #[arg(long)]
        partition: Option<String>,
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        qos: Option<String>,
        #[arg(long)]
        nodes: Option<u32>,
        #[arg(long)]
        ntasks: Option<u32>,
        #[arg(long)]
        gpu_name: Option<String>,
        #[arg(long)]
        gpu_type: Option<String>,
        #[arg(long, help = "Wall time limit, e.g. 02:00:00")]
        time: Option<String>,
    },
    Htcondor {
        #[arg(long)]
        os: Option<String>,
        #[arg(long)]
        worker_node: Option<String>,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        schedd: Option<String>,
        #[arg(long)]
        cm: Option<String>,
    },
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long)]
    user: String,
    #[arg(long, help = "slurm or htcondor")]
    cluster: String,
    #[arg(long, default_value = "all")]
    job_type: String,
    #[arg(long, help = "Only jobs queued at or after this site-local time (YYYY-MM-DD HH:MM:SS)")]
    since: Option<String>,
}

#[derive(Args)]
struct JobArgs {
    #[arg(long)]
    user: String,
    #[arg(long, help = "slurm or htcondor")]
    cluster: String,
    job_id: String,
}

#[derive(Subcommand)]
enum ReconcileMode {
    #[command(about = "Run each task once")]
    Once,
    #[command(about = "Run both tasks on their intervals until interrupted")]
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(logging::level_for_verbosity(cli.verbose));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(kind = ?error.kind, message = %error.message, "command failed");
            eprintln!("ink: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CoreResult<()> {
    let settings = Settings::load(&resolve_path(cli.config.as_deref()))?;

    if let Commands::Migrate = cli.command {
        let store = SqliteStore::new(&settings.database.path);
        store.migrate_to_latest()?;
        return print_json(&json!({
            "database": settings.database.path,
            "schema_version": current_schema_version(),
        }));
    }

    let service = JobService::from_settings(&settings)?;
    match cli.command {
        Commands::Submit(args) => {
            let outcome = service
                .submit(&args.user, args.backend_cluster(), job_spec(&args))
                .await?;
            print_json(&outcome)
        }
        Commands::Query(args) => {
            let mut filter = JobFilter::job_type(args.job_type);
            if let Some(since) = args.since.as_deref() {
                let instant = settings.clock().parse_wall_clock(since).ok_or_else(|| {
                    CoreError::new(
                        CoreErrorKind::InvalidInput,
                        format!("'{since}' is not a YYYY-MM-DD HH:MM:SS time"),
                    )
                })?;
                filter = filter.submitted_after(instant);
            }
            let jobs = service.query(&args.user, &args.cluster, filter).await?;
            print_json(&jobs)
        }
        Commands::Cancel(args) => {
            service.cancel(&args.user, &args.cluster, &args.job_id).await?;
            print_json(&json!({ "job_id": args.job_id, "status": "COMPLETED" }))
        }
        Commands::Output(args) => {
            let output = service
                .job_output(&args.user, &args.cluster, &args.job_id)
                .await?;
            print_json(&output)
        }
        Commands::Connect(args) => {
            let info = service
                .connect_info(&args.user, &args.cluster, &args.job_id)
                .await?;
            print_json(&info)
        }
        Commands::Reconcile { mode } => {
            let reconciler = Arc::new(service.reconciler(&settings));
            match mode {
                ReconcileMode::Once => {
                    let worker = reconciler.clone();
                    let (sweep, backfill) = tokio::task::spawn_blocking(move || {
                        (worker.sweep_vanished_jobs(), worker.backfill_job_times())
                    })
                    .await
                    .map_err(|join_error| {
                        CoreError::new(
                            CoreErrorKind::Internal,
                            format!("reconciliation join failure: {join_error}"),
                        )
                    })?;
                    print_json(&json!({
                        "sweep": tick_json(sweep?),
                        "backfill": tick_json(backfill?),
                    }))
                }
                ReconcileMode::Run => {
                    reconciler
                        .run_schedule(async {
                            if let Err(error) = tokio::signal::ctrl_c().await {
                                tracing::error!(%error, "cannot listen for ctrl-c");
                            }
                        })
                        .await;
                    Ok(())
                }
            }
        }
        Commands::Migrate => Ok(()),
    }
}

impl SubmitArgs {
    fn backend_cluster(&self) -> &'static str {
        match self.backend {
            SubmitBackend::Slurm { .. } => "slurm",
            SubmitBackend::Htcondor { .. } => "htcondor",
        }
    }
}

fn job_spec(args: &SubmitArgs) -> JobSpec {
    let backend = match &args.backend {
        SubmitBackend::Slurm {
            partition,
            account,
            qos,
            nodes,
            ntasks,
            gpu_name,
            gpu_type,
            time,
        } => BackendOptions::Slurm(SlurmOptions {
            partition: partition.clone(),
            account: account.clone(),
            qos: qos.clone(),
            nodes: *nodes,
            ntasks: *ntasks,
            gpu_name: gpu_name.clone(),
            gpu_type: gpu_type.clone(),
            time_limit: time.clone(),
        }),
        SubmitBackend::Htcondor {
            os,
            worker_node,
            arch,
            schedd,
            cm,
        } => BackendOptions::HtCondor(CondorOptions {
            os: os.clone(),
            worker_node: worker_node.clone(),
            arch: arch.clone(),
            schedd_host: schedd.clone(),
            cm_host: cm.clone(),
        }),
    };
    JobSpec {
        job_type: args.job_type.clone(),
        job_name: args.job_name.clone(),
        cpu: args.cpu,
        mem_mb: args.mem,
        gpu_num: args.gpu,
        arguments: args.arguments.clone(),
        backend,
    }
}

fn tick_json(outcome: TickOutcome) -> serde_json::Value {
    match outcome {
        TickOutcome::Skipped => json!({ "skipped": true }),
        TickOutcome::Ran(report) => json!({
            "skipped": false,
            "examined": report.examined,
            "updated": report.updated,
        }),
    }
}

fn print_json(value: &impl Serialize) -> CoreResult<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("cannot render output: {error}"),
        )
    })?;
    println!("{rendered}");
    Ok(())
}
