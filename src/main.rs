use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use jobplacer::config::SchedulerConfig;
use jobplacer::dashboard::{run_dashboard, DashboardState};
use jobplacer::driver::ExecutorDriver;
use jobplacer::scheduler::debug::{render_executor_table, render_job_table};
use jobplacer::scheduler::{Executor, ExecutorDebug, Job, JobDebug, Scheduler};
use jobplacer::shutdown::{install_shutdown_handler, shutdown_scheduler_on};
use jobplacer::worker::{KeepaliveSender, SimulatedExecutors, SimulationConfig};

#[derive(Parser, Debug)]
#[command(name = "jobplacer")]
#[command(version)]
#[command(about = "Places cost-weighted jobs onto capacity-limited executors")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler against in-process simulated executors
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of executors
    #[arg(long, default_value = "3")]
    executors: usize,

    /// Cost capacity of each executor
    #[arg(long, default_value = "10")]
    capacity: f64,

    /// Number of jobs
    #[arg(long, default_value = "20")]
    jobs: usize,

    /// Cost of each job
    #[arg(long, default_value = "1")]
    job_cost: f64,

    /// Jobs end after this many seconds on an executor (optional)
    #[arg(long)]
    job_duration_secs: Option<u64>,

    /// Maximum starting jobs per executor
    #[arg(long, default_value = "1")]
    simultaneous_starts: usize,

    /// Minimum gap between starts on one executor, in milliseconds
    #[arg(long, default_value = "0")]
    start_interval_ms: u64,

    /// Move a job when the load difference is at least this cost (0 disables)
    #[arg(long, default_value = "0")]
    load_balance: f64,

    /// Executor keepalive period in milliseconds (0 disables liveness)
    #[arg(long, default_value = "2000")]
    alive_ms: u64,

    /// Slack before ending or evicting jobs, in milliseconds
    #[arg(long, default_value = "0")]
    slack_ms: u64,

    /// Cap on jobs started at once across all executors (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_jobs: usize,

    /// Deadline for start and stop calls, in milliseconds (optional)
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Simulated start latency in milliseconds
    #[arg(long, default_value = "50")]
    start_latency_ms: u64,

    /// Simulated stop latency in milliseconds
    #[arg(long, default_value = "20")]
    stop_latency_ms: u64,

    /// Probability that a simulated start fails
    #[arg(long, default_value = "0")]
    failure_rate: f64,

    /// How long to run before printing and shutting down, in seconds
    #[arg(long, default_value = "10")]
    run_secs: u64,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JobOutput {
    id: String,
    #[serde(flatten)]
    timings: JobDebug,
}

#[derive(Serialize)]
struct SimulationOutput {
    executors: Vec<ExecutorDebug>,
    jobs: Vec<JobOutput>,
    situations: BTreeMap<String, u64>,
}

impl SimulateArgs {
    fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::new()
            .with_executor_alive_duration(Duration::from_millis(self.alive_ms))
            .with_simultaneous_starts(self.simultaneous_starts)
            .with_min_duration_between_simultaneous_starts(Duration::from_millis(
                self.start_interval_ms,
            ))
            .with_load_balance_if_cost_difference(self.load_balance)
            .with_slack(Duration::from_millis(self.slack_ms))
            .with_total_max_job_count(self.max_jobs)
            .with_job_is_running_on_successful_start(true);
        if let Some(ms) = self.call_timeout_ms {
            config = config.with_slow_funcs_timeout(Duration::from_millis(ms));
        }
        config
    }

    fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            start_latency: Duration::from_millis(self.start_latency_ms),
            stop_latency: Duration::from_millis(self.stop_latency_ms),
            start_failure_rate: self.failure_rate,
            ..SimulationConfig::default()
        }
    }
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.scheduler_config();
    let sim = Arc::new(SimulatedExecutors::<String>::new(args.simulation_config()));
    let driver: Arc<dyn ExecutorDriver<String>> = sim.clone();
    let (handle, join) = Scheduler::spawn(config.clone(), driver)?;

    let shutdown = install_shutdown_handler();
    shutdown_scheduler_on(shutdown.clone(), handle.clone());

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let state = DashboardState {
            handle: handle.clone(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    let keepalive_stop = shutdown.child_token();
    for n in 1..=args.executors {
        let id = format!("Wrk{}", n);
        handle
            .add_executor(Executor::new(id.clone(), args.capacity).with_name(id.clone()))
            .await?;
        if !config.executor_alive_duration.is_zero() {
            let sender = KeepaliveSender::for_alive_duration(config.executor_alive_duration);
            let (handle, cancel) = (handle.clone(), keepalive_stop.clone());
            tokio::spawn(async move { sender.run(handle, id, cancel).await });
        }
    }

    for n in 1..=args.jobs {
        let id = format!("J{}", n);
        let mut job = Job::new(id.clone(), args.job_cost).with_name(id);
        if let Some(secs) = args.job_duration_secs {
            job = job.with_duration(Duration::from_secs(secs));
        }
        handle.add_job(job).await?;
    }

    tracing::info!(
        executors = args.executors,
        jobs = args.jobs,
        run_secs = args.run_secs,
        "Simulation running"
    );
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_secs(args.run_secs)) => {}
    }

    let executors = handle.executor_snapshot().await;
    let jobs = handle.debug_snapshot().await;
    let situations: BTreeMap<String, u64> = sim
        .situation_counts()
        .into_iter()
        .map(|(s, n)| (s.to_string(), n))
        .collect();

    match args.output {
        OutputFormat::Json => {
            let mut job_list: Vec<JobOutput> = jobs
                .into_iter()
                .map(|(id, timings)| JobOutput { id, timings })
                .collect();
            job_list.sort_by(|a, b| a.id.cmp(&b.id));
            let output = SimulationOutput {
                executors,
                jobs: job_list,
                situations,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            print!("{}", render_executor_table(&executors));
            println!();
            print!("{}", render_job_table(&jobs));
            println!();
            println!("{:<32} COUNT", "SITUATION");
            for (situation, count) in &situations {
                println!("{:<32} {}", situation, count);
            }
        }
    }

    keepalive_stop.cancel();
    handle.shutdown();
    join.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Simulate(simulate_args) => {
            run_simulation(simulate_args).await?;
        }
    }

    Ok(())
}
