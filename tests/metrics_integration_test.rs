#[cfg(feature = "metrics")]
mod tests {
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Arc;
    use tidehook::metrics::metrics_routes;
    use tidehook::testing::get as test_get;
    use tidehook::webhooks::NoVerification;
    use tidehook::{
        Result, WebhookEvent, WebhookHandler, WebhookMetricsCollector, WebhookMonitor,
        WebhookProcessor,
    };

    #[derive(Debug, Deserialize)]
    struct PingEvent {
        id: String,
    }

    impl WebhookEvent for PingEvent {
        fn event_id(&self) -> &str {
            &self.id
        }

        fn event_type(&self) -> &str {
            "ping"
        }
    }

    struct PingHandler;

    #[async_trait]
    impl WebhookHandler<PingEvent> for PingHandler {
        type Output = ();

        async fn handle(&self, _event: &PingEvent) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_monitor_mirrors_into_prometheus() {
        let collector = Arc::new(WebhookMetricsCollector::new().unwrap());
        let monitor = Arc::new(WebhookMonitor::new().with_collector(collector.clone()));
        let processor =
            WebhookProcessor::new(PingHandler, NoVerification).with_monitor(monitor.clone());

        processor.process(br#"{"id":"p1"}"#, "").await.unwrap();
        processor.process(br#"{"id":"p1"}"#, "").await.unwrap();

        let count = |outcome: &str| {
            collector
                .events_total
                .with_label_values(&["ping", outcome])
                .get()
        };
        assert_eq!(count("started"), 1);
        assert_eq!(count("success"), 1);
        assert_eq!(count("duplicate"), 1);
        assert_eq!(collector.events_in_flight.get(), 0);

        monitor.reset_metrics();
        assert_eq!(count("started"), 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_prometheus_format() {
        let collector = Arc::new(WebhookMetricsCollector::new().unwrap());
        collector.record_started("ping");
        collector.record_failure("ping");

        let body = test_get(metrics_routes(collector, "/metrics"), "/metrics")
            .execute()
            .await
            .assert_ok()
            .body_string()
            .await;

        assert!(body.contains("# TYPE tidehook_webhook_events_total counter"));
        assert!(body.contains(r#"tidehook_webhook_events_total{event_type="ping",outcome="failure"} 1"#));
    }
}
