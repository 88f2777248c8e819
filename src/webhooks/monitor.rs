//! Per-event-type webhook counters and timing.
//!
//! One [`WebhookMonitor`] is built at startup and shared by `Arc` across
//! request handlers. Counters live for the process lifetime and are never
//! persisted.

use crate::clock::{Clock, elapsed_between, system_clock};
use crate::health::{ComponentHealth, HealthCheck, HealthStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(feature = "metrics")]
use crate::metrics::WebhookMetricsCollector;

/// Success rate at or above which the webhook pipeline reports healthy
pub const HEALTHY_SUCCESS_RATE: f64 = 0.95;

/// Success rate at or above which the webhook pipeline reports degraded
pub const DEGRADED_SUCCESS_RATE: f64 = 0.80;

/// Counters for one event type
///
/// `total_events >= successful_events + failed_events`; the difference is
/// events still in flight. Duplicates are counted separately and never touch
/// the other counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeMetric {
    pub total_events: u64,
    pub successful_events: u64,
    pub failed_events: u64,
    pub duplicate_events: u64,
    /// Cumulative moving average over successful events only.
    ///
    /// Float drift over very large counts is accepted.
    pub average_processing_time_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl EventTypeMetric {
    // An event started before reset_metrics finishes into a fresh record
    fn cover_outcomes(&mut self) {
        self.total_events = self
            .total_events
            .max(self.successful_events + self.failed_events);
    }

    /// Successful share of started events, 0.0 when nothing started
    pub fn success_rate(&self) -> f64 {
        if self.total_events == 0 {
            0.0
        } else {
            self.successful_events as f64 / self.total_events as f64
        }
    }
}

/// Aggregate view across all event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_events: u64,
    pub successful_events: u64,
    pub failed_events: u64,
    pub duplicate_events: u64,
    /// `successful_events / total_events`, 0.0 when there were no events
    pub success_rate: f64,
    /// Average over all successful events, weighted by each type's count
    pub average_processing_time_ms: f64,
    pub event_types: BTreeMap<String, EventTypeMetric>,
    pub generated_at: DateTime<Utc>,
}

/// Token returned by [`WebhookMonitor::start_processing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "pass the handle to record_success to time the event"]
pub struct StartHandle {
    started_at: DateTime<Utc>,
}

impl StartHandle {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Process-wide webhook counters
///
/// Each per-type update runs under the map's entry lock, so concurrent
/// requests can't lose increments.
pub struct WebhookMonitor {
    metrics: DashMap<String, EventTypeMetric>,
    clock: Arc<dyn Clock>,
    #[cfg(feature = "metrics")]
    collector: Option<Arc<WebhookMetricsCollector>>,
}

impl WebhookMonitor {
    pub fn new() -> Self {
        Self {
            metrics: DashMap::new(),
            clock: system_clock(),
            #[cfg(feature = "metrics")]
            collector: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mirror every recorded outcome into a Prometheus collector
    #[cfg(feature = "metrics")]
    pub fn with_collector(mut self, collector: Arc<WebhookMetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Count a new event and start its timer
    pub fn start_processing(&self, event_type: &str) -> StartHandle {
        self.metrics
            .entry(event_type.to_string())
            .or_default()
            .total_events += 1;

        #[cfg(feature = "metrics")]
        if let Some(ref collector) = self.collector {
            collector.record_started(event_type);
        }

        StartHandle {
            started_at: self.clock.now(),
        }
    }

    /// Record a successful event and fold its duration into the average
    pub fn record_success(&self, event_type: &str, handle: StartHandle) {
        let now = self.clock.now();
        let elapsed = elapsed_between(handle.started_at, now);
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        {
            let mut metric = self.metrics.entry(event_type.to_string()).or_default();
            metric.successful_events += 1;
            let n = metric.successful_events as f64;
            metric.average_processing_time_ms =
                (metric.average_processing_time_ms * (n - 1.0) + elapsed_ms) / n;
            metric.last_processed_at = Some(now);
            metric.cover_outcomes();
        }

        tracing::debug!(event_type, elapsed_ms, "Webhook event processed");

        #[cfg(feature = "metrics")]
        if let Some(ref collector) = self.collector {
            collector.record_success(event_type, elapsed);
        }
    }

    /// Record a failed event; failures don't affect the timing average
    pub fn record_failure(&self, event_type: &str) {
        let now = self.clock.now();
        {
            let mut metric = self.metrics.entry(event_type.to_string()).or_default();
            metric.failed_events += 1;
            metric.last_processed_at = Some(now);
            metric.cover_outcomes();
        }

        tracing::warn!(event_type, "Webhook event failed");

        #[cfg(feature = "metrics")]
        if let Some(ref collector) = self.collector {
            collector.record_failure(event_type);
        }
    }

    /// Record a redelivery served from the dedup cache
    pub fn record_duplicate(&self, event_type: &str) {
        self.metrics
            .entry(event_type.to_string())
            .or_default()
            .duplicate_events += 1;

        tracing::info!(event_type, "Duplicate webhook event skipped");

        #[cfg(feature = "metrics")]
        if let Some(ref collector) = self.collector {
            collector.record_duplicate(event_type);
        }
    }

    /// Snapshot of one event type's counters
    pub fn get_metrics(&self, event_type: &str) -> Option<EventTypeMetric> {
        self.metrics.get(event_type).map(|m| m.clone())
    }

    /// Aggregate snapshot across all event types
    pub fn summary(&self) -> MetricsSummary {
        let event_types: BTreeMap<String, EventTypeMetric> = self
            .metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut total_events = 0;
        let mut successful_events = 0;
        let mut failed_events = 0;
        let mut duplicate_events = 0;
        let mut weighted_time = 0.0;

        for metric in event_types.values() {
            total_events += metric.total_events;
            successful_events += metric.successful_events;
            failed_events += metric.failed_events;
            duplicate_events += metric.duplicate_events;
            weighted_time += metric.average_processing_time_ms * metric.successful_events as f64;
        }

        let success_rate = if total_events == 0 {
            0.0
        } else {
            successful_events as f64 / total_events as f64
        };
        let average_processing_time_ms = if successful_events == 0 {
            0.0
        } else {
            weighted_time / successful_events as f64
        };

        MetricsSummary {
            total_events,
            successful_events,
            failed_events,
            duplicate_events,
            success_rate,
            average_processing_time_ms,
            event_types,
            generated_at: self.clock.now(),
        }
    }

    /// Clear all counters
    ///
    /// For tests and admin-triggered resets; not meant for use under live traffic.
    pub fn reset_metrics(&self) {
        self.metrics.clear();

        #[cfg(feature = "metrics")]
        if let Some(ref collector) = self.collector {
            collector.reset();
        }

        tracing::info!("Webhook metrics reset");
    }

    /// Health derived from the overall success rate
    pub fn health(&self) -> ComponentHealth {
        let summary = self.summary();

        let (status, message) = if summary.total_events == 0 {
            (HealthStatus::Healthy, "No webhook events processed yet".to_string())
        } else {
            let status = if summary.success_rate >= HEALTHY_SUCCESS_RATE {
                HealthStatus::Healthy
            } else if summary.success_rate >= DEGRADED_SUCCESS_RATE {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            };
            let message = format!(
                "{} of {} webhook events succeeded ({:.1}%), {} failed",
                summary.successful_events,
                summary.total_events,
                summary.success_rate * 100.0,
                summary.failed_events
            );
            (status, message)
        };

        ComponentHealth {
            name: "webhooks".to_string(),
            status,
            message: Some(message),
        }
    }
}

impl Default for WebhookMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WebhookMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookMonitor")
            .field("event_types", &self.metrics.len())
            .finish()
    }
}

impl HealthCheck for WebhookMonitor {
    fn name(&self) -> &str {
        "webhooks"
    }

    fn check(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ComponentHealth> + Send + '_>> {
        Box::pin(async move { self.health() })
    }
}
