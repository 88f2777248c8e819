use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus mirror of the webhook monitor's counters
#[derive(Clone)]
pub struct WebhookMetricsCollector {
    /// Webhook events by type and outcome (started, success, failure, duplicate)
    pub events_total: IntCounterVec,

    /// Processing duration of successful events in seconds
    pub processing_duration_seconds: HistogramVec,

    /// Number of events currently being processed
    pub events_in_flight: IntGauge,

    registry: Arc<Registry>,
}

impl WebhookMetricsCollector {
    /// Create a collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector registering into an existing registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let events_total = IntCounterVec::new(
            Opts::new("webhook_events_total", "Total number of webhook events")
                .namespace("tidehook"),
            &["event_type", "outcome"],
        )?;

        // Handlers usually talk to other services, so buckets reach past the default backoff cap
        let processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "webhook_processing_duration_seconds",
                "Webhook processing duration in seconds",
            )
            .namespace("tidehook")
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["event_type"],
        )?;

        let events_in_flight = IntGauge::with_opts(
            Opts::new(
                "webhook_events_in_flight",
                "Number of webhook events currently being processed",
            )
            .namespace("tidehook"),
        )?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(processing_duration_seconds.clone()))?;
        registry.register(Box::new(events_in_flight.clone()))?;

        Ok(Self {
            events_total,
            processing_duration_seconds,
            events_in_flight,
            registry: Arc::new(registry),
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_started(&self, event_type: &str) {
        self.events_total
            .with_label_values(&[event_type, "started"])
            .inc();
        self.events_in_flight.inc();
    }

    pub fn record_success(&self, event_type: &str, duration: Duration) {
        self.events_total
            .with_label_values(&[event_type, "success"])
            .inc();
        self.processing_duration_seconds
            .with_label_values(&[event_type])
            .observe(duration.as_secs_f64());
        self.events_in_flight.dec();
    }

    pub fn record_failure(&self, event_type: &str) {
        self.events_total
            .with_label_values(&[event_type, "failure"])
            .inc();
        self.events_in_flight.dec();
    }

    pub fn record_duplicate(&self, event_type: &str) {
        self.events_total
            .with_label_values(&[event_type, "duplicate"])
            .inc();
    }

    /// Drop every recorded series
    pub fn reset(&self) {
        self.events_total.reset();
        self.processing_duration_seconds.reset();
        self.events_in_flight.set(0);
    }
}

impl std::fmt::Debug for WebhookMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookMetricsCollector")
            .field("events_in_flight", &self.events_in_flight.get())
            .finish_non_exhaustive()
    }
}
