//! Webhook reliability pipeline.
//!
//! [`WebhookProcessor`] composes the pieces for one delivery: signature
//! verification, deduplication by event id, retries around the handler and
//! per-event-type monitoring. [`WebhookRoutes`] exposes it over HTTP.

pub mod config;
pub mod handler;
pub mod idempotency;
pub mod monitor;
pub mod retry;
pub mod routes;
pub mod verification;

pub use config::{DedupConfig, RetryConfig, WebhookConfig};
pub use handler::{ProcessOutcome, WebhookEvent, WebhookHandler, WebhookProcessor};
pub use idempotency::{Claim, DedupEntry, DeduplicationCache, IdempotencyStore, SweeperHandle};
pub use monitor::{EventTypeMetric, MetricsSummary, StartHandle, WebhookMonitor};
pub use retry::{RetryContext, RetryError, RetryExecutor, RetryPolicy, execute_with_retry};
pub use routes::{WebhookResponse, WebhookRoutes, monitor_routes};
pub use verification::{
    NoVerification, SignatureAlgorithm, SignatureHeader, SignatureVerifier, VerificationResult,
    WebhookVerifier,
};
