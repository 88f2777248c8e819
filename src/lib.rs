//! tidehook - a webhook reliability layer for Axum
//!
//! Wraps a business handler with the pieces every webhook receiver ends up
//! needing:
//!
//! - **Verification**: timestamped `t=...,sha256=...` signatures with a replay window
//! - **Deduplication**: redeliveries of a processed event get the stored result
//! - **Retries**: bounded exponential backoff around the handler
//! - **Monitoring**: per-event-type counters, timings and a health status
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidehook::{ConfigBuilder, webhooks::{WebhookProcessor, WebhookRoutes}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     tidehook::init_tracing_with_config(&config);
//!
//!     let processor = Arc::new(WebhookProcessor::from_config(PaymentHandler, &config)?);
//!     let app = WebhookRoutes::new(processor)
//!         .with_path(&config.webhook.path)
//!         .with_signature_header(&config.webhook.signature_header)
//!         .router();
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
mod config;
mod error;
pub mod health;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod testing;
mod utils;
pub mod webhooks;

// Re-exports for public API
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder, LoggingConfig};
pub use error::{
    ErrorContext, ErrorResponse, ErrorWithContext, Result, SignatureError, TidehookError,
};
pub use health::{ComponentHealth, HealthCheck, HealthChecker, HealthStatus};
#[cfg(feature = "metrics")]
pub use metrics::WebhookMetricsCollector;
pub use webhooks::{
    DeduplicationCache, IdempotencyStore, ProcessOutcome, RetryExecutor, RetryPolicy,
    SignatureAlgorithm, SignatureVerifier, WebhookEvent, WebhookHandler, WebhookMonitor,
    WebhookProcessor, WebhookRoutes,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// Call once, early in `main()`.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "tidehook=debug")
/// - `TIDEHOOK_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install_subscriber(env_filter, json_logs);
}

/// Initialize tracing from the logging section of a [`Config`]
///
/// `RUST_LOG` still wins when set, so per-target filters keep working.
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    install_subscriber(env_filter, config.logging.json);
}

fn install_subscriber(env_filter: EnvFilter, json: bool) {
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
