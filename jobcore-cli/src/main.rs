use clap::{Parser, Subcommand};
use jobcore::config::{init_tracing, Config};
use jobcore::error::CoreResult;
use jobcore::pool::{ConnectionPool, PoolConfig};
use jobcore::queue::{QueueManager, RunnerRegistry};
use jobcore::runner::batch::BatchRunner;
use jobcore::runner::local::LocalRunner;
use jobcore::runner::ssh::SshRunner;
use jobcore::store::models::{
    ClusterKind, ErrorPolicy, GateKind, NewCluster, NewJob, RunnerKind, WorkflowDag,
};
use jobcore::orchestrator::Orchestrator;
use jobcore::store::Store;
use jobcore::CoreError;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jobcore")]
#[command(about = "Job orchestration core: submit, track, and schedule compute jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a single job
    Submit {
        name: String,
        /// Path to the script or input file to run
        input: PathBuf,
        #[arg(long, value_parser = ["local", "ssh", "batch"], default_value = "local")]
        runner: String,
        #[arg(long)]
        cluster: Option<i64>,
        #[arg(long, default_value = "shell")]
        code_kind: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Job ids this job depends on, as "id:gate" (gate in after-success|after-any|after-failure)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// Cancel a job
    Cancel { job_id: i64 },
    /// List jobs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a single job's details
    Show { job_id: i64 },
    /// Workflow operations
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Cluster operations
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },
    /// Apply pending store migrations and exit
    Migrate,
    /// Run the scheduler worker (Queue Manager + Orchestrator ticks) in the foreground
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommands,
    },
}

#[derive(Subcommand)]
enum SchedulerCommands {
    /// Start the scheduler worker and block until interrupted
    Run,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Submit a workflow DAG described as JSON (see spec.md §3 for the WorkflowDag shape)
    Submit {
        name: String,
        /// Path to a JSON file containing the WorkflowDag
        dag_file: PathBuf,
        #[arg(long, value_parser = ["fail-fast", "continue"], default_value = "fail-fast")]
        error_policy: String,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    Add {
        name: String,
        #[arg(long, value_parser = ["ssh", "batch"])]
        kind: String,
        #[arg(long)]
        hostname: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long)]
        username: String,
        #[arg(long, default_value_t = 1)]
        max_concurrent: i64,
        #[arg(long, default_value = "{}")]
        connection_config: String,
    },
    Remove {
        cluster_id: i64,
    },
    List,
}

fn runner_registry(config: &Config, store: Arc<Store>) -> RunnerRegistry {
    let pool = ConnectionPool::new(PoolConfig {
        connect_timeout: config.connect_timeout,
        probe_timeout: config.probe_timeout,
        ..Default::default()
    });
    RunnerRegistry {
        local: Arc::new(LocalRunner::new()),
        ssh: Arc::new(SshRunner::new(pool.clone(), store.clone(), config.submit_timeout)),
        batch: Arc::new(BatchRunner::new(pool, store, config.submit_timeout)),
    }
}

async fn run() -> CoreResult<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    let store = Arc::new(Store::open(&config).await?);

    match cli.command {
        Commands::Migrate => {
            println!("store migrated to the latest schema version");
        }
        Commands::Submit {
            name,
            input,
            runner,
            cluster,
            code_kind,
            priority,
            depends_on,
        } => {
            let runners = runner_registry(&config, store.clone());
            let queue = QueueManager::new(
                store.clone(),
                runners,
                config.scratch_dir.clone(),
                config.scheduler_interval,
            );
            let input_blob = std::fs::read_to_string(&input)
                .map_err(|e| CoreError::validation(format!("cannot read '{}': {e}", input.display())))?;
            let mut dependencies = Vec::with_capacity(depends_on.len());
            for raw in &depends_on {
                let (id_part, gate_part) = raw.split_once(':').ok_or_else(|| {
                    CoreError::validation(format!("malformed --depends-on '{raw}', expected id:gate"))
                })?;
                let dep_id = id_part
                    .parse::<i64>()
                    .map_err(|_| CoreError::validation(format!("bad job id in '{raw}'")))?;
                let gate = GateKind::from_str(gate_part)?;
                dependencies.push((jobcore::ids::JobId(dep_id), gate));
            }
            let attrs = NewJob {
                name,
                work_dir: String::new(),
                code_kind,
                runner_kind: RunnerKind::from_str(&runner)?,
                cluster_id: cluster.map(jobcore::ids::ClusterId),
                parallelism: serde_json::json!({}),
                input_blob,
            };
            let job_id = queue.submit(attrs, dependencies, priority).await?;
            println!("submitted job {job_id}");
        }
        Commands::Cancel { job_id } => {
            let runners = runner_registry(&config, store.clone());
            let queue = QueueManager::new(
                store.clone(),
                runners,
                config.scratch_dir.clone(),
                config.scheduler_interval,
            );
            queue.cancel(jobcore::ids::JobId(job_id)).await?;
            println!("cancelled job {job_id}");
        }
        Commands::List { status } => {
            let jobs = match status {
                Some(s) => {
                    store
                        .get_jobs_by_status(jobcore::store::models::JobStatus::from_str(&s)?)
                        .await?
                }
                None => {
                    let mut all = Vec::new();
                    for s in [
                        jobcore::store::models::JobStatus::Pending,
                        jobcore::store::models::JobStatus::Ready,
                        jobcore::store::models::JobStatus::Scheduled,
                        jobcore::store::models::JobStatus::Running,
                        jobcore::store::models::JobStatus::Completed,
                        jobcore::store::models::JobStatus::Failed,
                        jobcore::store::models::JobStatus::Cancelled,
                    ] {
                        all.extend(store.get_jobs_by_status(s).await?);
                    }
                    all
                }
            };
            for job in jobs {
                println!("{}\t{}\t{}\t{}", job.id, job.name, job.status, job.runner_kind);
            }
        }
        Commands::Show { job_id } => {
            let job = store.get_job(jobcore::ids::JobId(job_id)).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Workflow { command } => match command {
            WorkflowCommands::Submit {
                name,
                dag_file,
                error_policy,
            } => {
                let raw = std::fs::read_to_string(&dag_file).map_err(|e| {
                    CoreError::validation(format!("cannot read '{}': {e}", dag_file.display()))
                })?;
                let dag: WorkflowDag = serde_json::from_str(&raw)?;
                let runners = runner_registry(&config, store.clone());
                let queue = QueueManager::new(
                    store.clone(),
                    runners,
                    config.scratch_dir.clone(),
                    config.scheduler_interval,
                );
                let orchestrator = Orchestrator::new(
                    store.clone(),
                    queue,
                    config.scratch_dir.clone(),
                    config.scheduler_interval,
                );
                let workflow_id = orchestrator
                    .submit_workflow(name, dag, ErrorPolicy::from_str(&error_policy)?)
                    .await?;
                println!("submitted workflow {workflow_id}");
            }
        },
        Commands::Cluster { command } => match command {
            ClusterCommands::Add {
                name,
                kind,
                hostname,
                port,
                username,
                max_concurrent,
                connection_config,
            } => {
                let connection_config: serde_json::Value = serde_json::from_str(&connection_config)?;
                let cluster_id = store
                    .create_cluster(NewCluster {
                        name,
                        kind: ClusterKind::from_str(&kind)?,
                        hostname,
                        port,
                        username,
                        connection_config,
                        max_concurrent,
                    })
                    .await?;
                println!("added cluster {cluster_id}");
            }
            ClusterCommands::Remove { cluster_id } => {
                store.remove_cluster(jobcore::ids::ClusterId(cluster_id)).await?;
                println!("removed cluster {cluster_id}");
            }
            ClusterCommands::List => {
                for cluster in store.list_clusters().await? {
                    println!(
                        "{}\t{}\t{}\t{}@{}:{}\tmax_concurrent={}",
                        cluster.id,
                        cluster.name,
                        cluster.kind.as_str(),
                        cluster.username,
                        cluster.hostname,
                        cluster.port,
                        cluster.max_concurrent
                    );
                }
            }
        },
        Commands::Scheduler { command } => match command {
            SchedulerCommands::Run => {
                let runners = runner_registry(&config, store.clone());
                let queue = QueueManager::new(
                    store.clone(),
                    runners,
                    config.scratch_dir.clone(),
                    config.scheduler_interval,
                );
                let orchestrator = Orchestrator::new(
                    store.clone(),
                    queue.clone(),
                    config.scratch_dir.clone(),
                    config.scheduler_interval,
                );
                println!("scheduler running, interval {:?} (Ctrl-C to stop)", config.scheduler_interval);
                tokio::select! {
                    res = queue.run() => res?,
                    res = orchestrator.run() => res?,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received shutdown signal");
                    }
                }
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}
