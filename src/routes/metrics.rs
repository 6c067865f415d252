use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::JobQueue;

/// State of the scrape endpoint, separate from [`crate::app_state::AppState`].
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<dyn JobQueue>,
}

/// Prometheus metrics scrape endpoint.
/// Refreshes the queue depth gauge, then renders the text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.queue.depth().await {
        Ok(depth) => {
            for (label, value) in [
                ("waiting", depth.waiting),
                ("active", depth.active),
                ("delayed", depth.delayed),
                ("dead", depth.dead),
            ] {
                metrics::gauge!("duplicate_check_queue_depth", "state" => label).set(value as f64);
            }
        }
        Err(e) => tracing::debug!(error = %e, "Queue depth unavailable for scrape"),
    }

    state.handle.render()
}
