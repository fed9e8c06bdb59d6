use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratebucket::config::RateBucketConfig;
use ratebucket::ratelimit::{Bucket, LimitConfig};
use ratebucket::store::MemoryStore;

/// Drive a token bucket limiter with simulated load.
#[derive(Debug, Parser)]
#[command(name = "ratebucket", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bucket capacity
    #[arg(long)]
    capacity: Option<i64>,

    /// Override the tokens added per refill interval
    #[arg(long)]
    refill_rate: Option<i64>,

    /// Override the refill interval in milliseconds
    #[arg(long)]
    refill_interval_ms: Option<u64>,

    /// Rate limit key to send requests for
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Number of concurrent workers sending requests
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Tokens taken per request
    #[arg(long, default_value_t = 1)]
    tokens: i64,

    /// Keep the store running until Ctrl+C or SIGTERM after the load finishes
    #[arg(long)]
    wait: bool,

    /// Emit logs and the final report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Ratebucket");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => RateBucketConfig::from_file(path)?,
        None => RateBucketConfig::default(),
    };
    apply_overrides(&mut config.limit, &cli);
    info!(
        capacity = config.limit.capacity,
        refill_rate = config.limit.refill_rate,
        refill_interval = ?config.limit.refill_interval,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::with_config(config.memory_store.clone()));
    let bucket = Arc::new(Bucket::new(Arc::clone(&store), config.limit)?);

    // Run store maintenance alongside the load
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let maintenance = if config.memory_store.cleanup_interval_ms > 0 {
        Some(tokio::spawn(Arc::clone(&store).run(async move {
            let _ = stop_rx.await;
        })))
    } else {
        info!("Bucket cleanup disabled");
        None
    };

    let report = drive_load(&bucket, &cli).await?;
    info!(
        allowed = report.allowed,
        denied = report.denied,
        remaining = report.remaining,
        "Load finished"
    );

    if cli.wait {
        info!("Waiting for shutdown signal");
        shutdown_signal().await;
    }

    if let Some(handle) = maintenance {
        let _ = stop_tx.send(());
        match handle.await? {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "Store did not shut down cleanly"),
        }
    }

    let stats = store.stats();
    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "allowed": report.allowed,
                "denied": report.denied,
                "remaining": report.remaining,
                "stats": stats,
            })
        );
    } else {
        println!(
            "allowed={} denied={} remaining={}",
            report.allowed, report.denied, report.remaining
        );
        println!(
            "buckets_created={} buckets_removed={} active_buckets={}",
            stats.buckets_created, stats.buckets_removed, stats.active_buckets
        );
    }

    info!("Ratebucket stopped");
    Ok(())
}

fn apply_overrides(limit: &mut LimitConfig, cli: &Cli) {
    if let Some(capacity) = cli.capacity {
        limit.capacity = capacity;
    }
    if let Some(refill_rate) = cli.refill_rate {
        limit.refill_rate = refill_rate;
    }
    if let Some(ms) = cli.refill_interval_ms {
        limit.refill_interval = Duration::from_millis(ms);
    }
}

struct LoadReport {
    allowed: usize,
    denied: usize,
    remaining: i64,
}

/// Send `cli.requests` requests for one key from `cli.concurrency` workers.
async fn drive_load(bucket: &Arc<Bucket<MemoryStore>>, cli: &Cli) -> anyhow::Result<LoadReport> {
    let workers = cli.concurrency.max(1);
    let mut set = tokio::task::JoinSet::new();

    for worker in 0..workers {
        let bucket = Arc::clone(bucket);
        let key = cli.key.clone();
        let tokens = cli.tokens;
        let share = cli.requests / workers + usize::from(worker < cli.requests % workers);

        set.spawn(async move {
            let mut allowed = 0usize;
            for _ in 0..share {
                if bucket.allow_n(&key, tokens).await?.allowed() {
                    allowed += 1;
                }
            }
            Ok::<_, ratebucket::error::RateBucketError>((allowed, share - allowed))
        });
    }

    let mut report = LoadReport {
        allowed: 0,
        denied: 0,
        remaining: 0,
    };
    while let Some(joined) = set.join_next().await {
        let (allowed, denied) = joined??;
        report.allowed += allowed;
        report.denied += denied;
    }
    report.remaining = bucket.status(&cli.key).await?.remaining();

    Ok(report)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
