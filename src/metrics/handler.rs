use super::collector::WebhookMetricsCollector;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use std::sync::Arc;

/// Handler for the /metrics endpoint
pub async fn metrics_handler(
    State(collector): State<Arc<WebhookMetricsCollector>>,
) -> Result<Response<Body>, StatusCode> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = collector.registry().gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Router serving Prometheus text at `path`
pub fn metrics_routes(collector: Arc<WebhookMetricsCollector>, path: &str) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .with_state(collector)
}
