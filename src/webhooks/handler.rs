use crate::config::Config;
use crate::error::{Result, TidehookError};
use crate::webhooks::idempotency::{Claim, DeduplicationCache, IdempotencyStore, SweeperHandle};
use crate::webhooks::monitor::WebhookMonitor;
use crate::webhooks::retry::{RetryContext, RetryPolicy, execute_with_retry};
use crate::webhooks::verification::WebhookVerifier;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Trait representing a webhook event
pub trait WebhookEvent: DeserializeOwned + Send + Sync + 'static {
    /// Get the unique event ID for idempotency checking
    fn event_id(&self) -> &str;

    /// Get the event type/name
    fn event_type(&self) -> &str;
}

/// Business logic run for each new (non-duplicate) event
///
/// `Output` is what gets cached and replayed to redeliveries of the same
/// event, so it must be cheap to clone.
///
/// # Example
///
/// ```rust,ignore
/// use tidehook::webhooks::{WebhookEvent, WebhookHandler};
///
/// #[derive(Deserialize)]
/// struct PaymentEvent {
///     id: String,
///     #[serde(rename = "type")]
///     kind: String,
///     amount: u64,
/// }
///
/// impl WebhookEvent for PaymentEvent {
///     fn event_id(&self) -> &str {
///         &self.id
///     }
///
///     fn event_type(&self) -> &str {
///         &self.kind
///     }
/// }
///
/// struct LedgerHandler {
///     ledger: Ledger,
/// }
///
/// #[async_trait]
/// impl WebhookHandler<PaymentEvent> for LedgerHandler {
///     type Output = LedgerEntryId;
///
///     async fn handle(&self, event: &PaymentEvent) -> Result<LedgerEntryId> {
///         self.ledger.credit(event.amount).await
///     }
/// }
/// ```
#[async_trait]
pub trait WebhookHandler<E: WebhookEvent>: Send + Sync + 'static {
    type Output: Clone + Send + Sync + Serialize + 'static;

    /// Handle the webhook event. Errors are retried per the processor's policy.
    async fn handle(&self, event: &E) -> Result<Self::Output>;

    /// Optional: Reject an event before it is claimed. Not retried.
    async fn validate(&self, _event: &E) -> Result<()> {
        Ok(())
    }

    /// Optional: Called once processing has definitively failed
    async fn on_error(&self, event: &E, error: &TidehookError) {
        tracing::error!(
            event_id = event.event_id(),
            event_type = event.event_type(),
            error = %error,
            "Webhook processing failed"
        );
    }
}

/// What the pipeline did with a delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "lowercase")]
pub enum ProcessOutcome<R> {
    /// The handler ran for this delivery
    Processed(R),
    /// A previous delivery was processed; this is its stored result
    Duplicate(R),
}

impl<R> ProcessOutcome<R> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ProcessOutcome::Duplicate(_))
    }

    pub fn result(&self) -> &R {
        match self {
            ProcessOutcome::Processed(result) | ProcessOutcome::Duplicate(result) => result,
        }
    }

    pub fn into_result(self) -> R {
        match self {
            ProcessOutcome::Processed(result) | ProcessOutcome::Duplicate(result) => result,
        }
    }
}

/// Verify, deduplicate, retry and record one webhook delivery at a time
///
/// Build once at startup and share behind an `Arc`; every component it holds
/// is safe to use from concurrent requests.
pub struct WebhookProcessor<E, H>
where
    E: WebhookEvent,
    H: WebhookHandler<E>,
{
    handler: Arc<H>,
    verifier: Arc<dyn WebhookVerifier>,
    store: Arc<dyn IdempotencyStore<H::Output>>,
    monitor: Arc<WebhookMonitor>,
    retry_policy: RetryPolicy,
    deadline: Option<Duration>,
    // Stops the background purge when the processor is dropped
    _sweeper: Option<SweeperHandle>,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> WebhookProcessor<E, H>
where
    E: WebhookEvent,
    H: WebhookHandler<E>,
{
    /// Create a processor with an in-memory dedup cache, a fresh monitor and
    /// the default retry policy
    pub fn new(handler: H, verifier: impl WebhookVerifier + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            verifier: Arc::new(verifier),
            store: Arc::new(DeduplicationCache::<H::Output>::new()),
            monitor: Arc::new(WebhookMonitor::new()),
            retry_policy: RetryPolicy::default(),
            deadline: None,
            _sweeper: None,
            _event: PhantomData,
        }
    }

    /// Create a processor from validated configuration
    ///
    /// When a sweep interval is configured and a tokio runtime is running,
    /// the dedup cache's background purge is started and lives as long as
    /// the processor.
    pub fn from_config(handler: H, config: &Config) -> Result<Self> {
        let verifier = config.signature_verifier()?;
        let store = DeduplicationCache::<H::Output>::new()
            .with_ttl(config.dedup.ttl())
            .with_claim_ttl(config.dedup.claim_ttl());

        let sweeper = match config.dedup.sweep_interval() {
            Some(interval) if tokio::runtime::Handle::try_current().is_ok() => {
                Some(store.spawn_sweeper(interval))
            }
            Some(_) => {
                tracing::warn!("No tokio runtime running, dedup sweeper not started");
                None
            }
            None => None,
        };

        let mut processor = Self::new(handler, verifier)
            .with_store(Arc::new(store))
            .with_retry_policy(config.retry.policy());
        processor.deadline = config.webhook.deadline();
        processor._sweeper = sweeper;

        Ok(processor)
    }

    pub fn with_store(mut self, store: Arc<dyn IdempotencyStore<H::Output>>) -> Self {
        self.store = store;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<WebhookMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Bound the total time spent in the handler, retries and backoff included
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn monitor(&self) -> &Arc<WebhookMonitor> {
        &self.monitor
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Run the full pipeline for a raw delivery
    ///
    /// Signature and payload errors are returned before anything is counted
    /// or cached.
    pub async fn process(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<ProcessOutcome<H::Output>> {
        self.verifier.verify_signature(payload, signature).await?;

        let event: E = serde_json::from_slice(payload)
            .map_err(|e| TidehookError::invalid_payload(e.to_string()))?;

        self.handle_verified(event).await
    }

    /// Run the pipeline for an event whose signature was already checked
    pub async fn handle_verified(&self, event: E) -> Result<ProcessOutcome<H::Output>> {
        let event_id = event.event_id().to_string();
        let event_type = event.event_type().to_string();

        self.handler.validate(&event).await?;

        match self.store.claim(&event_id).await? {
            Claim::Cached(result) => {
                self.monitor.record_duplicate(&event_type);
                tracing::debug!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Skipping already processed event"
                );
                return Ok(ProcessOutcome::Duplicate(result));
            }
            Claim::InFlight => {
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Event is already being processed by another delivery"
                );
                return Err(TidehookError::ProcessingInFlight { event_id });
            }
            Claim::Claimed => {}
        }

        let started = self.monitor.start_processing(&event_type);
        let guard = ClaimGuard {
            store: self.store.clone(),
            monitor: self.monitor.clone(),
            event_id: event_id.clone(),
            event_type: event_type.clone(),
            armed: true,
        };
        let context = RetryContext::new(&event_type, &event_id, "webhook_handler");
        let handler = &self.handler;
        let event_ref = &event;
        let attempts = execute_with_retry(
            move || handler.handle(event_ref),
            &self.retry_policy,
            &context,
        );

        let outcome = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, attempts).await {
                Ok(result) => result.map_err(TidehookError::from),
                Err(_) => Err(TidehookError::DeadlineExceeded(deadline)),
            },
            None => attempts.await.map_err(TidehookError::from),
        };

        match outcome {
            Ok(result) => {
                if let Err(e) = self.store.mark_processed(&event_id, result.clone()).await {
                    // The handler already ran, so the delivery still succeeds
                    tracing::error!(
                        event_id = %event_id,
                        event_type = %event_type,
                        error = %e,
                        "Failed to store webhook result"
                    );
                }
                self.monitor.record_success(&event_type, started);
                guard.disarm();

                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Webhook processed successfully"
                );

                Ok(ProcessOutcome::Processed(result))
            }
            Err(error) => {
                self.monitor.record_failure(&event_type);
                guard.disarm();

                if let Err(e) = self.store.release(&event_id).await {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to release webhook claim"
                    );
                }

                self.handler.on_error(&event, &error).await;
                Err(error)
            }
        }
    }
}

impl<E, H> std::fmt::Debug for WebhookProcessor<E, H>
where
    E: WebhookEvent,
    H: WebhookHandler<E>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookProcessor")
            .field("monitor", &self.monitor)
            .field("retry_policy", &self.retry_policy)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Settles a claimed delivery whose future is dropped before it finishes
///
/// Counts the delivery as failed and releases its claim, so a redelivery
/// after a client disconnect is processed instead of waiting out `claim_ttl`.
struct ClaimGuard<R: Send + 'static> {
    store: Arc<dyn IdempotencyStore<R>>,
    monitor: Arc<WebhookMonitor>,
    event_id: String,
    event_type: String,
    armed: bool,
}

impl<R: Send + 'static> ClaimGuard<R> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<R: Send + 'static> Drop for ClaimGuard<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.monitor.record_failure(&self.event_type);
        tracing::error!(
            event_id = %self.event_id,
            event_type = %self.event_type,
            "Webhook processing cancelled before completion"
        );

        if self.store.abandon(&self.event_id) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                let event_id = std::mem::take(&mut self.event_id);
                runtime.spawn(async move {
                    if let Err(e) = store.release(&event_id).await {
                        tracing::warn!(
                            event_id = %event_id,
                            error = %e,
                            "Failed to release cancelled webhook claim"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    event_id = %self.event_id,
                    "No tokio runtime running, claim kept until it expires"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignatureError;
    use crate::webhooks::verification::{NoVerification, SignatureVerifier};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Deserialize)]
    struct TestEvent {
        id: String,
        #[serde(rename = "type")]
        kind: String,
    }

    impl WebhookEvent for TestEvent {
        fn event_id(&self) -> &str {
            &self.id
        }

        fn event_type(&self) -> &str {
            &self.kind
        }
    }

    /// Fails `failures` times, then returns the call count
    struct CountingHandler {
        calls: Arc<AtomicU32>,
        failures: u32,
    }

    impl CountingHandler {
        fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    calls: calls.clone(),
                    failures,
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl WebhookHandler<TestEvent> for CountingHandler {
        type Output = u32;

        async fn handle(&self, _event: &TestEvent) -> Result<u32> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(TidehookError::transient(format!("attempt {} failed", call)));
            }
            Ok(call)
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl WebhookHandler<TestEvent> for SlowHandler {
        type Output = ();

        async fn handle(&self, _event: &TestEvent) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    /// Hangs on the first call only, like a stuck downstream that recovers
    struct SlowOnceHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl WebhookHandler<TestEvent> for SlowOnceHandler {
        type Output = u32;

        async fn handle(&self, _event: &TestEvent) -> Result<u32> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 1 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(call)
        }
    }

    const PAYLOAD: &[u8] = br#"{"id":"evt_1","type":"payment.succeeded"}"#;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    #[tokio::test]
    async fn test_duplicate_served_from_cache() {
        let (handler, calls) = CountingHandler::new(0);
        let processor = WebhookProcessor::new(handler, NoVerification);

        let first = processor.process(PAYLOAD, "").await.unwrap();
        let second = processor.process(PAYLOAD, "").await.unwrap();

        assert_eq!(first, ProcessOutcome::Processed(1));
        assert_eq!(second, ProcessOutcome::Duplicate(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metric = processor.monitor().get_metrics("payment.succeeded").unwrap();
        assert_eq!(metric.total_events, 1);
        assert_eq!(metric.successful_events, 1);
        assert_eq!(metric.duplicate_events, 1);
    }

    #[tokio::test]
    async fn test_signature_checked_before_anything_else() {
        let (handler, calls) = CountingHandler::new(0);
        let verifier = SignatureVerifier::new("whsec_test");
        let processor = WebhookProcessor::new(handler, verifier.clone());

        let err = processor.process(PAYLOAD, "t=1,sha256=00").await.unwrap_err();
        assert!(matches!(err, TidehookError::Signature(_)));

        let header = verifier.generate(PAYLOAD, None);
        let mut tampered = PAYLOAD.to_vec();
        tampered[8] ^= 0x01;
        let err = processor.process(&tampered, &header).await.unwrap_err();
        assert!(matches!(
            err,
            TidehookError::Signature(SignatureError::SignatureMismatch)
        ));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(processor.monitor().summary().total_events, 0);

        let outcome = processor.process(PAYLOAD, &header).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed(1));
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let (handler, calls) = CountingHandler::new(0);
        let processor = WebhookProcessor::new(handler, NoVerification);

        let err = processor.process(b"{not json", "").await.unwrap_err();
        assert!(matches!(err, TidehookError::InvalidPayload(_)));

        let err = processor.process(br#"{"id":"evt_1"}"#, "").await.unwrap_err();
        assert!(matches!(err, TidehookError::InvalidPayload(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (handler, calls) = CountingHandler::new(2);
        let processor =
            WebhookProcessor::new(handler, NoVerification).with_retry_policy(fast_policy(3));

        let outcome = processor.process(PAYLOAD, "").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let metric = processor.monitor().get_metrics("payment.succeeded").unwrap();
        assert_eq!(metric.total_events, 1);
        assert_eq!(metric.successful_events, 1);
        assert_eq!(metric.failed_events, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_release_claim() {
        let (handler, calls) = CountingHandler::new(2);
        let processor =
            WebhookProcessor::new(handler, NoVerification).with_retry_policy(fast_policy(1));

        let err = processor.process(PAYLOAD, "").await.unwrap_err();
        match err {
            TidehookError::ExhaustedRetries {
                event_type,
                event_id,
                attempts,
                ..
            } => {
                assert_eq!(event_type, "payment.succeeded");
                assert_eq!(event_id, "evt_1");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let metric = processor.monitor().get_metrics("payment.succeeded").unwrap();
        assert_eq!(metric.failed_events, 1);

        // A provider redelivery is processed again, not treated as a duplicate
        let outcome = processor.process(PAYLOAD, "").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed(3));
    }

    #[tokio::test]
    async fn test_in_flight_delivery_is_rejected() {
        let (handler, calls) = CountingHandler::new(0);
        let store = Arc::new(DeduplicationCache::<u32>::new());
        let processor =
            WebhookProcessor::new(handler, NoVerification).with_store(store.clone());

        assert_eq!(store.claim("evt_1"), Claim::Claimed);

        let err = processor.process(PAYLOAD, "").await.unwrap_err();
        assert!(matches!(
            err,
            TidehookError::ProcessingInFlight { ref event_id } if event_id == "evt_1"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let processor = WebhookProcessor::new(SlowHandler, NoVerification)
            .with_retry_policy(RetryPolicy::none())
            .with_deadline(Duration::from_secs(5));

        let err = processor.process(PAYLOAD, "").await.unwrap_err();
        assert!(matches!(err, TidehookError::DeadlineExceeded(d) if d == Duration::from_secs(5)));

        let metric = processor.monitor().get_metrics("payment.succeeded").unwrap();
        assert_eq!(metric.failed_events, 1);
        assert_eq!(metric.successful_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_delivery_releases_claim() {
        let handler = SlowOnceHandler {
            calls: AtomicU32::new(0),
        };
        let processor =
            WebhookProcessor::new(handler, NoVerification).with_retry_policy(RetryPolicy::none());

        // The caller gives up, dropping the pipeline mid-handler
        let cancelled =
            tokio::time::timeout(Duration::from_secs(5), processor.process(PAYLOAD, "")).await;
        assert!(cancelled.is_err());

        let metric = processor.monitor().get_metrics("payment.succeeded").unwrap();
        assert_eq!(metric.total_events, 1);
        assert_eq!(metric.failed_events, 1);
        assert_eq!(metric.successful_events, 0);

        // The provider's redelivery is not rejected as in flight
        let outcome = processor.process(PAYLOAD, "").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_delivery_with_async_only_store() {
        struct AsyncOnlyStore(DeduplicationCache<u32>);

        #[async_trait]
        impl IdempotencyStore<u32> for AsyncOnlyStore {
            async fn check(&self, event_id: &str) -> Result<Option<u32>> {
                Ok(self.0.check(event_id))
            }

            async fn mark_processed(&self, event_id: &str, result: u32) -> Result<()> {
                self.0.mark_processed(event_id, result);
                Ok(())
            }

            async fn claim(&self, event_id: &str) -> Result<Claim<u32>> {
                Ok(self.0.claim(event_id))
            }

            async fn release(&self, event_id: &str) -> Result<()> {
                self.0.release(event_id);
                Ok(())
            }
        }

        let handler = SlowOnceHandler {
            calls: AtomicU32::new(0),
        };
        let processor = WebhookProcessor::new(handler, NoVerification)
            .with_retry_policy(RetryPolicy::none())
            .with_store(Arc::new(AsyncOnlyStore(DeduplicationCache::new())));

        let cancelled =
            tokio::time::timeout(Duration::from_secs(5), processor.process(PAYLOAD, "")).await;
        assert!(cancelled.is_err());

        // Paused time only advances once the spawned release has run
        tokio::time::sleep(Duration::from_millis(1)).await;

        let outcome = processor.process(PAYLOAD, "").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed(2));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(ProcessOutcome::Duplicate(7)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "duplicate", "result": 7}));
        assert!(ProcessOutcome::Duplicate(7).is_duplicate());
        assert_eq!(ProcessOutcome::Processed(7).into_result(), 7);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = crate::config::ConfigBuilder::new()
            .with_secret("whsec_test")
            .with_max_retries(0)
            .with_deadline(Duration::from_secs(10))
            .build()
            .unwrap();

        let (handler, _) = CountingHandler::new(0);
        let processor = WebhookProcessor::from_config(handler, &config).unwrap();
        assert_eq!(processor.retry_policy().max_retries, 0);
        assert_eq!(processor.deadline(), Some(Duration::from_secs(10)));

        let header = config.signature_verifier().unwrap().generate(PAYLOAD, None);
        assert!(processor.process(PAYLOAD, &header).await.is_ok());
    }
}
