use photo_dedup::{
    config::AppConfig,
    db::{self, PgFingerprintStore, PgPhotoRepository, PhotoRepository},
    services::{
        detector::PerceptualDetector,
        fetch::HttpFetcher,
        queue::{JobQueue, RedisQueue},
    },
    worker::{describe_metrics, run_maintenance, Worker, WorkerConfig},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// How long one dequeue blocks on Redis before the loop re-checks shutdown.
const POLL_WAIT: Duration = Duration::from_secs(5);
/// Pause after a queue error (e.g. Redis down) before claiming again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Largest image the detector will download.
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting duplicate-check worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Serve worker metrics on their own listener
    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("WORKER_METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");
    tracing::info!(%metrics_addr, "Serving worker metrics");

    describe_metrics();

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize services
    tracing::info!(topic = %config.queue_topic, "Initializing services");
    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisQueue::new(
            &config.redis_url,
            &config.queue_topic,
            config.visibility_timeout(),
        )
        .expect("Failed to initialize job queue"),
    );
    let photos: Arc<dyn PhotoRepository> = Arc::new(PgPhotoRepository::new(db_pool.clone()));

    let fetcher = HttpFetcher::new(config.job_timeout(), MAX_IMAGE_BYTES)
        .expect("Failed to initialize HTTP client");
    let detector = Arc::new(PerceptualDetector::new(
        Arc::new(fetcher),
        Arc::new(PgFingerprintStore::new(db_pool)),
        config.duplicate_max_distance,
    ));

    let worker_config = WorkerConfig {
        retry: config.retry_policy(),
        job_timeout: config.job_timeout(),
        poll_wait: POLL_WAIT,
        error_backoff: ERROR_BACKOFF,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();

    let concurrency = config.worker_concurrency.max(1);
    for n in 0..concurrency {
        let worker = Worker::new(
            format!("worker-{n}"),
            queue.clone(),
            detector.clone(),
            photos.clone(),
            worker_config.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { worker.run(shutdown).await });
    }

    tasks.spawn(run_maintenance(
        queue.clone(),
        photos.clone(),
        worker_config.retry.max_attempts,
        config.reconcile_interval(),
        shutdown_rx.clone(),
    ));

    tracing::info!(concurrency, "Worker ready, processing duplicate checks");

    shutdown_signal().await;
    tracing::info!("Shutdown requested, finishing in-flight jobs");
    let _ = shutdown_tx.send(true);

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Worker stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
