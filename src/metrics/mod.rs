//! Prometheus export of webhook processing metrics.
//!
//! [`WebhookMetricsCollector`] mirrors what
//! [`WebhookMonitor`](crate::webhooks::WebhookMonitor) records into a
//! Prometheus registry, and [`metrics_routes`] serves it in text format.

mod collector;
mod handler;

pub use collector::WebhookMetricsCollector;
pub use handler::{metrics_handler, metrics_routes};
