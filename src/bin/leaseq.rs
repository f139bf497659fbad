//! leaseq CLI: run a worker against a lease queue, or operate on one.

use std::time::Duration;

use clap::{Parser, Subcommand};
use leaseq::LeaseQueue;
use leaseq::config::Config;
use leaseq::config::secrets::{ExposeSecret, redacted_url};
use leaseq::telemetry::{TelemetryConfig, init_telemetry};
use leaseq::worker::{SleepHandler, Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "leaseq", about = "Lease-based distributed work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker: lease items, do the work, complete them
    Work {
        /// Lease duration in seconds (defaults to LEASE_SECS)
        #[arg(long)]
        lease_secs: Option<u64>,
        /// Seconds to block on each lease call (defaults to LEASE_WAIT_SECS)
        #[arg(long)]
        wait_secs: Option<u64>,
        /// Simulated work per item, in seconds
        #[arg(long, default_value_t = 10)]
        work_secs: u64,
        /// Keep waiting for work after the queue drains
        #[arg(long)]
        keep_running: bool,
    },
    /// Add items to the queue (each parsed as JSON, else taken as a string)
    Enqueue {
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Show pending and leased counts
    Stats,
    /// Return expired leases to the queue
    Reclaim,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leaseq".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    tracing::debug!(store = %redacted_url(&config.store_url), queue = %config.queue_name, "connecting");
    let queue = LeaseQueue::connect(&config.queue_name, config.store_url.expose_secret())
        .await?
        .with_poll_interval(config.poll_interval);

    match cli.command {
        Command::Work {
            lease_secs,
            wait_secs,
            work_secs,
            keep_running,
        } => {
            let mut worker_config = WorkerConfig::from_config(&config);
            if let Some(secs) = lease_secs {
                anyhow::ensure!(secs > 0, "--lease-secs must be greater than zero");
                worker_config.lease_duration = Duration::from_secs(secs);
            }
            if let Some(secs) = wait_secs {
                worker_config.wait_timeout = Duration::from_secs(secs);
            }
            worker_config.exit_when_empty = !keep_running;
            cmd_work(queue, worker_config, Duration::from_secs(work_secs)).await
        }
        Command::Enqueue { items } => cmd_enqueue(&queue, items).await,
        Command::Stats => cmd_stats(&queue).await,
        Command::Reclaim => {
            let reclaimed = queue.reclaim_expired().await?;
            println!("Reclaimed {reclaimed} expired lease(s)");
            Ok(())
        }
    }
}

async fn cmd_work(
    queue: LeaseQueue,
    config: WorkerConfig,
    work_time: Duration,
) -> anyhow::Result<()> {
    println!("Worker with session: {}", queue.session_id());

    let worker = Worker::new(queue, SleepHandler::new(work_time), config);

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    let report = worker.run().await?;
    println!(
        "Done: {} completed, {} expired before completion, {} failed",
        report.completed, report.expired, report.failed
    );
    Ok(())
}

async fn cmd_enqueue(queue: &LeaseQueue, items: Vec<String>) -> anyhow::Result<()> {
    for raw in items {
        let payload = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
        let id = queue.enqueue(payload).await?;
        println!("Enqueued: {id}");
    }
    Ok(())
}

async fn cmd_stats(queue: &LeaseQueue) -> anyhow::Result<()> {
    let stats = queue.stats().await?;
    println!("Queue:    {}", stats.queue);
    println!("Pending:  {}", stats.pending);
    println!("Leased:   {}", stats.leased);
    println!("Empty:    {}", stats.is_empty());
    Ok(())
}
