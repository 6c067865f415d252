use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use photo_dedup::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgPhotoRepository},
    routes::{self, metrics::MetricsState},
    services::{queue::RedisQueue, storage::S3BlobStore},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing photo-dedup server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("photos_uploaded_total", "Photos stored by the upload endpoint");
    metrics::describe_counter!(
        "photo_upload_failures_total",
        "Files of an upload batch that could not be stored"
    );
    metrics::describe_counter!(
        "duplicate_check_jobs_enqueued_total",
        "Duplicate-check jobs enqueued"
    );
    metrics::describe_counter!(
        "duplicate_check_enqueue_failures_total",
        "Duplicate checks deferred because the queue was unavailable"
    );
    metrics::describe_gauge!(
        "duplicate_check_queue_depth",
        "Duplicate-check jobs per queue state"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize blob storage client
    tracing::info!("Initializing S3 storage client");
    let storage = S3BlobStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
        &config.s3_public_url,
    )
    .expect("Failed to initialize S3 client");

    // Initialize Redis job queue. An unreachable Redis does not block startup;
    // uploads defer their checks until it comes back.
    tracing::info!(topic = %config.queue_topic, "Connecting to Redis job queue");
    let queue = Arc::new(
        RedisQueue::new(
            &config.redis_url,
            &config.queue_topic,
            config.visibility_timeout(),
        )
        .expect("Failed to initialize job queue"),
    );

    // Create shared application state
    let state = AppState::new(
        Arc::new(PgPhotoRepository::new(db_pool)),
        Arc::new(storage),
        queue.clone(),
        config.max_upload_files,
        config.thumbnail_width,
    );
    let metrics_state = MetricsState {
        handle: prometheus_handle,
        queue,
    };

    let app = routes::router(state, metrics_state, config.max_upload_bytes);

    tracing::info!("Starting photo-dedup on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
