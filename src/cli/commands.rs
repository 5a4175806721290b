//! CLI command definitions for skyscan.
//!
//! Every process of a scan is one subcommand of the same binary: the fleet
//! starts `produce`, `work` and `consolidate` on its nodes, and `queue-stats`
//! and `recover` are operator tools against the broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fleet::{load_token, DockerProvisioner, FleetConfig, FleetManager, HttpMonitoringRegistry};
use crate::metrics::{init_metrics, write_metrics_file, MetricsCollector};
use crate::pipeline::{
    run_consolidator, run_worker, CommandReconstructor, ConsolidatorConfig, DirectorySink,
    PixelScanSplitter, Producer, QueueConfig, WorkerConfig, DEFAULT_VARIANTS,
};
use crate::queue::RedisQueue;

/// Distributed pixel-scan dispatch.
#[derive(Parser)]
#[command(name = "skyscan")]
#[command(about = "Distribute pixel reconstructions over a queue and run the fleet that hosts them")]
#[command(version)]
#[command(
    long_about = "skyscan splits an event into per-pixel reconstruction jobs, runs them on queue workers and keeps the best fit per pixel.\n\nExample usage:\n  skyscan --address broker.internal produce --nside 8 event.bin\n  skyscan --address broker.internal work --command fit-pixel\n  skyscan --address broker.internal consolidate --output ./results"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Broker host, host:port or redis:// URL.
    #[arg(
        short,
        long,
        default_value = "localhost",
        env = "SKYSCAN_BROKER_ADDRESS",
        global = true
    )]
    pub address: String,

    /// Write Prometheus metrics in text format to this file on exit.
    #[arg(long, global = true)]
    pub metrics_file: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Split an event into pixel jobs and publish them.
    Produce(ProduceArgs),

    /// Consume jobs, reconstruct them and publish the results.
    Work(WorkArgs),

    /// Collect results and write the best fit of every pixel.
    Consolidate(ConsolidateArgs),

    /// Provision a complete fleet and run it until it finishes.
    Fleet(FleetArgs),

    /// Show pending, in-flight and dead-lettered counts of queues.
    QueueStats(QueueStatsArgs),

    /// Move deliveries left unacknowledged by crashed consumers back to a queue.
    Recover(RecoverArgs),
}

/// Arguments for `skyscan produce`.
#[derive(Parser, Debug)]
pub struct ProduceArgs {
    /// Queue to publish jobs to.
    #[arg(short, long, default_value = "inqueue")]
    pub queue: String,

    /// Pixel resolution; must be a power of two.
    #[arg(long, default_value = "8")]
    pub nside: u32,

    /// Position variants per pixel.
    #[arg(long, default_value_t = DEFAULT_VARIANTS)]
    pub variants: u32,

    /// Event file to scan.
    pub event: PathBuf,
}

/// Arguments for `skyscan work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Queue to consume jobs from.
    #[arg(short, long, default_value = "inqueue")]
    pub in_queue: String,

    /// Queue to publish results to.
    #[arg(short, long, default_value = "outqueue")]
    pub out_queue: String,

    /// Stop after this many seconds without a job.
    #[arg(short, long, default_value = "10")]
    pub timeout: u64,

    /// Extra seconds to wait after each job.
    #[arg(long, default_value = "0")]
    pub sleep: u64,

    /// Reconstruction program, run as `<command> [args...] <input> <output>`.
    #[arg(short, long)]
    pub command: String,

    /// Kill a reconstruction that runs longer than this many seconds.
    #[arg(long)]
    pub fit_timeout: Option<u64>,

    /// Directory for per-job staging files.
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Extra arguments passed to the reconstruction program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Arguments for `skyscan consolidate`.
#[derive(Parser, Debug)]
pub struct ConsolidateArgs {
    /// Queue to consume results from.
    #[arg(short, long, default_value = "outqueue")]
    pub queue: String,

    /// Stop after this many seconds without a result.
    #[arg(short, long, default_value = "30")]
    pub timeout: u64,

    /// Variants expected per pixel.
    #[arg(long, default_value_t = DEFAULT_VARIANTS)]
    pub variants: u32,

    /// Directory selected results are written to.
    #[arg(short, long, default_value = "./results")]
    pub output: PathBuf,
}

/// Arguments for `skyscan fleet`.
#[derive(Parser, Debug)]
pub struct FleetArgs {
    /// Fleet YAML file; built-in defaults when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of worker nodes.
    #[arg(short, long)]
    pub num: Option<u32>,

    /// Lease duration in hours.
    #[arg(long)]
    pub lease_hours: Option<f64>,

    /// Monitoring target registration endpoint.
    #[arg(long, env = "SKYSCAN_MONITORING_URL")]
    pub monitoring_url: Option<String>,

    /// Bearer token for the monitoring endpoint (overrides the token file).
    #[arg(long, env = "SKYSCAN_MONITORING_TOKEN", hide_env_values = true)]
    pub monitoring_token: Option<String>,

    /// Docker network the nodes are attached to.
    #[arg(long)]
    pub docker_network: Option<String>,
}

/// Arguments for `skyscan queue-stats`.
#[derive(Parser, Debug)]
pub struct QueueStatsArgs {
    /// Queues to inspect.
    #[arg(short, long, default_values = ["inqueue", "outqueue"])]
    pub queue: Vec<String>,

    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `skyscan recover`.
#[derive(Parser, Debug)]
pub struct RecoverArgs {
    /// Queue whose unacknowledged deliveries are recovered.
    #[arg(short, long)]
    pub queue: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Ctrl-C cancels the running command; consumers finish the message in hand
/// and the fleet tears down before this returns.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let token = CancellationToken::new();
    spawn_interrupt_handler(token.clone());

    let result = match cli.command {
        Commands::Produce(args) => run_produce_command(&cli.address, args).await,
        Commands::Work(args) => run_work_command(&cli.address, args, &token).await,
        Commands::Consolidate(args) => run_consolidate_command(&cli.address, args, &token).await,
        Commands::Fleet(args) => run_fleet_command(args, &token).await,
        Commands::QueueStats(args) => run_queue_stats_command(&cli.address, args).await,
        Commands::Recover(args) => run_recover_command(&cli.address, args).await,
    };

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics file");
        }
    }

    result
}

fn spawn_interrupt_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            token.cancel();
        }
    });
}

async fn connect(address: &str) -> anyhow::Result<Arc<RedisQueue>> {
    let queue = RedisQueue::connect(address)
        .await
        .with_context(|| format!("Failed to connect to broker at {address}"))?;
    Ok(Arc::new(queue))
}

async fn run_produce_command(address: &str, args: ProduceArgs) -> anyhow::Result<()> {
    let event = tokio::fs::read(&args.event)
        .await
        .with_context(|| format!("Failed to read event file {}", args.event.display()))?;

    let transport = connect(address).await?;
    let producer = Producer::new(transport, &args.queue);
    let published = producer
        .produce(&PixelScanSplitter::new(args.nside, args.variants), &event)
        .await?;

    println!("Published {} jobs to {}", published, args.queue);
    Ok(())
}

fn worker_config(address: &str, args: &WorkArgs) -> WorkerConfig {
    WorkerConfig::new()
        .with_in_queue(&args.in_queue)
        .with_out_queue(&args.out_queue)
        .with_sleep(Duration::from_secs(args.sleep))
        .with_queue(
            QueueConfig::new()
                .with_address(address)
                .with_idle_timeout(Duration::from_secs(args.timeout)),
        )
}

fn consolidator_config(address: &str, args: &ConsolidateArgs) -> ConsolidatorConfig {
    ConsolidatorConfig::new()
        .with_queue_name(&args.queue)
        .with_variants(args.variants)
        .with_output_dir(&args.output)
        .with_queue(
            QueueConfig::new()
                .with_address(address)
                .with_idle_timeout(Duration::from_secs(args.timeout)),
        )
}

async fn run_work_command(
    address: &str,
    args: WorkArgs,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let config = worker_config(address, &args);
    config.validate()?;

    let mut reconstructor = CommandReconstructor::new(&args.command).with_args(args.args);
    if let Some(secs) = args.fit_timeout {
        reconstructor = reconstructor.with_timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = args.scratch_dir {
        reconstructor = reconstructor.with_scratch_dir(dir);
    }

    let transport = connect(&config.queue.address).await?;
    let report = run_worker(&config, transport, Arc::new(reconstructor), token).await?;

    println!(
        "Worker stopped ({}): {} acked, {} requeued, {} dead-lettered",
        report.reason, report.stats.acked, report.stats.requeued, report.stats.dead_lettered
    );
    Ok(())
}

async fn run_consolidate_command(
    address: &str,
    args: ConsolidateArgs,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let config = consolidator_config(address, &args);
    config.validate()?;

    let transport = connect(&config.queue.address).await?;
    let sink = Arc::new(DirectorySink::new(&config.output_dir));
    let report = run_consolidator(&config, transport, sink, token).await?;

    println!(
        "Consolidator stopped ({}): {} pixels written to {}, {} incomplete",
        report.consume.reason,
        report.emitted,
        config.output_dir.display(),
        report.incomplete.len()
    );
    Ok(())
}

async fn run_fleet_command(args: FleetArgs, token: &CancellationToken) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => FleetConfig::load(path)
            .with_context(|| format!("Failed to load fleet config {}", path.display()))?,
        None => FleetConfig::default(),
    };
    if let Some(num) = args.num {
        config = config.with_num_workers(num);
    }
    if let Some(hours) = args.lease_hours {
        config = config.with_lease_hours(hours);
    }
    if let Some(url) = args.monitoring_url {
        config = config.with_monitoring_url(url);
    }
    config.validate()?;

    let token_value = match (args.monitoring_token, &config.monitoring.token_file) {
        (Some(value), _) => Some(value),
        (None, Some(path)) => Some(load_token(path)?),
        (None, None) => None,
    };
    let mut registry = HttpMonitoringRegistry::new(&config.monitoring.url);
    match token_value {
        Some(value) => registry = registry.with_token(value),
        None => warn!("No monitoring token configured, registering without authentication"),
    }

    let mut provider = DockerProvisioner::connect()?;
    if let Some(network) = args.docker_network {
        provider = provider.with_network(network);
    }

    let manager = FleetManager::new(config, Arc::new(provider), Arc::new(registry));
    let outcome = manager.run(token).await?;

    println!("Fleet {} finished: {}", manager.run_id(), outcome);
    Ok(())
}

async fn run_queue_stats_command(address: &str, args: QueueStatsArgs) -> anyhow::Result<()> {
    let transport = connect(address).await?;
    let metrics = MetricsCollector::new();

    let mut all = Vec::with_capacity(args.queue.len());
    for queue in &args.queue {
        let stats = transport.stats(queue).await?;
        metrics.update_queue_depth(queue, stats.pending);
        all.push(stats);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&all)?);
    } else {
        println!("{:<20} {:>10} {:>10} {:>12}", "QUEUE", "PENDING", "IN FLIGHT", "DEAD LETTER");
        for stats in &all {
            println!(
                "{:<20} {:>10} {:>10} {:>12}",
                stats.queue_name, stats.pending, stats.in_flight, stats.dead_letter
            );
        }
    }
    Ok(())
}

async fn run_recover_command(address: &str, args: RecoverArgs) -> anyhow::Result<()> {
    let transport = connect(address).await?;
    let recovered = transport.recover_unacked(&args.queue).await?;
    println!("Recovered {} deliveries to {}", recovered, args.queue);
    Ok(())
}
