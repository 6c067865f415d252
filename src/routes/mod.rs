use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod health;
pub mod metrics;
pub mod photos;

use self::metrics::MetricsState;

/// Build the HTTP router. Uploads are bounded by `max_upload_bytes` for the
/// whole request instead of axum's per-extractor default.
pub fn router(state: AppState, metrics_state: MetricsState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/upload", post(photos::upload_photos))
        .route("/api/v1/photos", get(photos::list_photos))
        .route(
            "/api/v1/photos/{id}",
            get(photos::get_photo).delete(photos::delete_photo),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}
