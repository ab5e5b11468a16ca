use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use turnstile::clock::{Clock, SystemClock};
use turnstile::config::GatewayConfig;
use turnstile::gateway::{GatewayServer, GatewayState};
use turnstile::metrics::init_metrics;
use turnstile::ratelimit::{Limiter, TokenBucketLimiter};
use turnstile::store::{CounterStore, LogSink, MemoryStore, RedisStore, RedisStoreConfig};
use turnstile::telemetry::{TelemetryLayer, TelemetryQueue, TelemetryQueueConfig};

/// Rate-limiting HTTP API gateway
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatewayConfig::load(args.config.as_deref())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Remote collaborators: Redis when configured, otherwise in-process
    let (counters, sink): (Option<Arc<dyn CounterStore>>, Arc<dyn LogSink>) =
        match config.redis.url.as_deref() {
            Some(url) => {
                let store = Arc::new(
                    RedisStore::connect(
                        url,
                        RedisStoreConfig {
                            recent_capacity: config.telemetry.recent_capacity,
                            daily_retention: config.telemetry.daily_retention(),
                        },
                    )
                    .await?,
                );
                let counters: Arc<dyn CounterStore> = store.clone();
                let sink: Arc<dyn LogSink> = store;
                (Some(counters), sink)
            }
            None => {
                let store = Arc::new(
                    MemoryStore::with_clock(config.telemetry.recent_capacity, clock.clone())
                        .with_daily_retention(config.telemetry.daily_retention()),
                );
                let counters: Arc<dyn CounterStore> = store.clone();
                let sink: Arc<dyn LogSink> = store;
                (Some(counters), sink)
            }
        };

    let queue = Arc::new(TelemetryQueue::new(
        sink.clone(),
        TelemetryQueueConfig {
            capacity: config.telemetry.queue_capacity,
            persist_timeout: config.telemetry.persist_timeout(),
        },
    ));

    init_tracing(&config, &args, queue.clone())?;

    info!("Starting Turnstile gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let metrics = init_metrics()?;

    queue.start();

    let limiter = Limiter::from_config(&config.rate_limit, counters, clock)?;
    if let Some(local) = limiter.local() {
        spawn_idle_sweeper(local.clone(), config.rate_limit.idle_sweep_interval_secs);
    }

    let mut state = GatewayState::new(limiter.backend(), config.rate_limit.requests_per_minute)
        .with_trusted_forwarding(config.server.trust_forwarded_headers);
    if config.telemetry.enabled {
        state = state.with_queue(queue.clone());
    }

    let mut server = GatewayServer::new(config.server.http_addr, state, sink).with_metrics(metrics);
    match config.server.logs_token.clone() {
        Some(token) => server = server.with_logs_token(token),
        None => info!("No server.logs_token configured, /api/logs is disabled"),
    }
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    // Drain buffered records even if the server failed
    queue.stop().await;
    info!(dropped = queue.dropped(), "Turnstile gateway stopped");

    served?;
    Ok(())
}

/// Install the global subscriber: env filter, console output and the
/// telemetry forwarding layer.
fn init_tracing(
    config: &GatewayConfig,
    args: &Args,
    queue: Arc<TelemetryQueue>,
) -> anyhow::Result<()> {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))?;

    let fmt_layer = if args.json || config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .boxed()
    };

    let telemetry = config
        .telemetry
        .enabled
        .then(|| config.telemetry.forward_level())
        .transpose()?
        .map(|min_level| TelemetryLayer::new(queue, min_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(telemetry)
        .try_init()?;
    Ok(())
}

/// Periodically drop token buckets that have fully refilled.
fn spawn_idle_sweeper(limiter: Arc<TokenBucketLimiter>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = limiter.prune_idle();
            debug!(removed, tracked = limiter.bucket_count(), "Idle bucket sweep finished");
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
