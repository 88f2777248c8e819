//! Axum endpoints for receiving webhooks and reading their metrics.

use crate::error::{ErrorContext, Result, TidehookError};
use crate::health::{HealthChecker, health_routes};
use crate::webhooks::handler::{ProcessOutcome, WebhookEvent, WebhookHandler, WebhookProcessor};
use crate::webhooks::monitor::{EventTypeMetric, MetricsSummary, WebhookMonitor};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;

/// Response body for an accepted delivery
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse<R> {
    pub received: bool,
    pub duplicate: bool,
    pub result: R,
}

impl<R> From<ProcessOutcome<R>> for WebhookResponse<R> {
    fn from(outcome: ProcessOutcome<R>) -> Self {
        Self {
            received: true,
            duplicate: outcome.is_duplicate(),
            result: outcome.into_result(),
        }
    }
}

struct ReceiverState<E, H>
where
    E: WebhookEvent,
    H: WebhookHandler<E>,
{
    processor: Arc<WebhookProcessor<E, H>>,
    signature_header: String,
}

/// Builder for the webhook receiver router
///
/// ```rust,ignore
/// let processor = Arc::new(WebhookProcessor::from_config(handler, &config)?);
/// let app = WebhookRoutes::new(processor)
///     .with_path(&config.webhook.path)
///     .with_signature_header(&config.webhook.signature_header)
///     .router();
/// ```
#[must_use = "builder does nothing until you call router()"]
pub struct WebhookRoutes<E, H>
where
    E: WebhookEvent,
    H: WebhookHandler<E>,
{
    processor: Arc<WebhookProcessor<E, H>>,
    path: String,
    signature_header: String,
    health: bool,
}

impl<E, H> WebhookRoutes<E, H>
where
    E: WebhookEvent,
    H: WebhookHandler<E>,
{
    pub fn new(processor: Arc<WebhookProcessor<E, H>>) -> Self {
        Self {
            processor,
            path: "/webhooks".to_string(),
            signature_header: "X-Signature".to_string(),
            health: true,
        }
    }

    /// Route the receiver is mounted on (default `/webhooks`)
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Header carrying the signature (default `X-Signature`)
    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into();
        self
    }

    /// Whether to also serve `GET /health` backed by the monitor
    pub fn with_health(mut self, enabled: bool) -> Self {
        self.health = enabled;
        self
    }

    /// Build the router: receiver, metrics snapshot and (optionally) health
    pub fn router(self) -> Router {
        let monitor = self.processor.monitor().clone();

        let receiver = Router::new()
            .route(&self.path, post(receive_webhook::<E, H>))
            .with_state(Arc::new(ReceiverState {
                processor: self.processor,
                signature_header: self.signature_header,
            }));

        let mut router = receiver.merge(monitor_routes(monitor.clone()));

        if self.health {
            let checker = HealthChecker::new().with_check(monitor);
            router = router.merge(health_routes(Arc::new(checker)));
        }

        router
    }
}

async fn receive_webhook<E, H>(
    State(state): State<Arc<ReceiverState<E, H>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    E: WebhookEvent,
    H: WebhookHandler<E>,
{
    let signature = match headers
        .get(state.signature_header.as_str())
        .map(|value| value.to_str())
    {
        Some(Ok(value)) => value,
        Some(Err(_)) => {
            return TidehookError::from(crate::error::SignatureError::MalformedSignature(
                "signature header is not valid ASCII".to_string(),
            ))
            .into_response();
        }
        None => {
            return TidehookError::from(crate::error::SignatureError::MalformedSignature(
                format!("missing {} header", state.signature_header),
            ))
            .into_response();
        }
    };

    match state.processor.process(&body, signature).await {
        Ok(outcome) => Json(WebhookResponse::from(outcome)).into_response(),
        Err(error) => {
            let context = match &error {
                TidehookError::ExhaustedRetries {
                    event_type,
                    event_id,
                    ..
                } => Some(ErrorContext::new().for_event(event_type, event_id)),
                TidehookError::ProcessingInFlight { event_id } => {
                    Some(ErrorContext::new().with_context("event_id", event_id.clone()))
                }
                _ => None,
            };
            error.into_response_with_context(context)
        }
    }
}

/// Router serving `GET /webhooks/metrics` and `GET /webhooks/metrics/{event_type}`
pub fn monitor_routes(monitor: Arc<WebhookMonitor>) -> Router {
    Router::new()
        .route("/webhooks/metrics", get(metrics_summary))
        .route("/webhooks/metrics/{event_type}", get(event_type_metrics))
        .with_state(monitor)
}

async fn metrics_summary(State(monitor): State<Arc<WebhookMonitor>>) -> Json<MetricsSummary> {
    Json(monitor.summary())
}

async fn event_type_metrics(
    State(monitor): State<Arc<WebhookMonitor>>,
    Path(event_type): Path<String>,
) -> Result<Json<EventTypeMetric>> {
    monitor
        .get_metrics(&event_type)
        .map(Json)
        .ok_or_else(|| TidehookError::not_found(format!("no metrics for event type {}", event_type)))
}
