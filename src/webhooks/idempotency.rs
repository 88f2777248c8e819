use crate::clock::{Clock, system_clock};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default retention for processed events (24 hours)
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default age after which an unfinished claim is considered abandoned
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(5 * 60);

/// Result of an atomic claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim<R> {
    /// Caller owns the event and must either mark it processed or release it
    Claimed,
    /// Event was already processed; here is the stored result
    Cached(R),
    /// Another delivery of the same event is being processed right now
    InFlight,
}

/// Trait for storing processed webhook event results to prevent duplicate processing
///
/// The in-memory [`DeduplicationCache`] is process-local. Deployments with
/// more than one instance behind a load balancer need an implementation
/// backed by a shared store with conditional writes, otherwise two
/// instances can each accept the same event as new.
#[async_trait]
pub trait IdempotencyStore<R: Send + 'static>: Send + Sync {
    /// Return the stored result for an event, if it was processed within the retention window
    async fn check(&self, event_id: &str) -> Result<Option<R>>;

    /// Store the result of a processed event (last write wins)
    async fn mark_processed(&self, event_id: &str, result: R) -> Result<()>;

    /// Atomically check for a stored result and, if absent, claim the event
    async fn claim(&self, event_id: &str) -> Result<Claim<R>>;

    /// Give up a claim taken by [`claim`](Self::claim) without storing a result
    async fn release(&self, event_id: &str) -> Result<()>;

    /// Clean up expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Drop a pending claim without awaiting
    ///
    /// Used when a delivery is cancelled mid-flight and no future can be
    /// awaited. Returns `false` if the store can only release
    /// asynchronously; the caller then schedules [`release`](Self::release).
    fn abandon(&self, _event_id: &str) -> bool {
        false
    }
}

/// Stored result of a processed event
#[derive(Debug, Clone)]
pub struct DedupEntry<R> {
    pub result: R,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum Slot<R> {
    Pending { claimed_at: DateTime<Utc> },
    Done(DedupEntry<R>),
}

/// In-memory idempotency store keyed by provider event id
///
/// Backed by a [`DashMap`], so concurrent deliveries are safe and
/// [`claim`](Self::claim) is atomic per event id. Entries older than the TTL
/// are never returned; they're dropped on access and by
/// [`purge_expired`](Self::purge_expired) / [`spawn_sweeper`](Self::spawn_sweeper).
///
/// Cloning is cheap and shares the underlying map.
#[derive(Clone)]
pub struct DeduplicationCache<R> {
    entries: Arc<DashMap<String, Slot<R>>>,
    ttl: Duration,
    claim_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<R: Clone + Send + Sync + 'static> DeduplicationCache<R> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl: DEFAULT_DEDUP_TTL,
            claim_ttl: DEFAULT_CLAIM_TTL,
            clock: system_clock(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn older_than(recorded: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
        crate::clock::elapsed_between(recorded, now) > limit
    }

    fn is_expired(&self, slot: &Slot<R>, now: DateTime<Utc>) -> bool {
        match slot {
            Slot::Done(entry) => Self::older_than(entry.recorded_at, now, self.ttl),
            Slot::Pending { claimed_at } => Self::older_than(*claimed_at, now, self.claim_ttl),
        }
    }

    /// Look up a processed event
    ///
    /// Pending claims read as absent. An expired entry is removed and reads
    /// as absent.
    pub fn check(&self, event_id: &str) -> Option<R> {
        let now = self.clock.now();

        // The read guard must be dropped before remove_if touches the same shard
        let expired = match self.entries.get(event_id) {
            None => return None,
            Some(slot) => match &*slot {
                Slot::Done(entry) if !Self::older_than(entry.recorded_at, now, self.ttl) => {
                    return Some(entry.result.clone());
                }
                Slot::Done(_) => true,
                Slot::Pending { .. } => false,
            },
        };

        if expired {
            self.entries
                .remove_if(event_id, |_, slot| matches!(slot, Slot::Done(_)) && self.is_expired(slot, now));
            tracing::debug!(event_id, "Dropped expired dedup entry");
        }

        None
    }

    /// Store the result of a processed event, completing any pending claim
    pub fn mark_processed(&self, event_id: &str, result: R) {
        let entry = DedupEntry {
            result,
            recorded_at: self.clock.now(),
        };
        self.entries.insert(event_id.to_string(), Slot::Done(entry));
    }

    /// Atomic check-and-claim for an event id
    pub fn claim(&self, event_id: &str) -> Claim<R> {
        let now = self.clock.now();

        match self.entries.entry(event_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = match occupied.get() {
                    slot if self.is_expired(slot, now) => None,
                    Slot::Done(entry) => Some(Claim::Cached(entry.result.clone())),
                    Slot::Pending { .. } => Some(Claim::InFlight),
                };

                match existing {
                    Some(claim) => claim,
                    None => {
                        occupied.insert(Slot::Pending { claimed_at: now });
                        Claim::Claimed
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Pending { claimed_at: now });
                Claim::Claimed
            }
        }
    }

    /// Drop a pending claim; processed entries are left alone
    pub fn release(&self, event_id: &str) {
        self.entries
            .remove_if(event_id, |_, slot| matches!(slot, Slot::Pending { .. }));
    }

    /// Remove expired entries and abandoned claims
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        self.entries.retain(|_, slot| {
            let keep = !self.is_expired(slot, now);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Purged expired dedup entries");
        }

        removed
    }

    /// Number of stored entries, including pending claims and not-yet-purged expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` on a background task
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let cache = self.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Dedup sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        cache.purge_expired();
                    }
                }
            }

            tracing::info!("Dedup sweeper stopped");
        });

        SweeperHandle {
            shutdown_tx,
            handle,
        }
    }
}

impl<R: Clone + Send + Sync + 'static> Default for DeduplicationCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for DeduplicationCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("claim_ttl", &self.claim_ttl)
            .finish()
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> IdempotencyStore<R> for DeduplicationCache<R> {
    async fn check(&self, event_id: &str) -> Result<Option<R>> {
        Ok(DeduplicationCache::check(self, event_id))
    }

    async fn mark_processed(&self, event_id: &str, result: R) -> Result<()> {
        DeduplicationCache::mark_processed(self, event_id, result);
        Ok(())
    }

    async fn claim(&self, event_id: &str) -> Result<Claim<R>> {
        Ok(DeduplicationCache::claim(self, event_id))
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        DeduplicationCache::release(self, event_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(DeduplicationCache::purge_expired(self))
    }

    fn abandon(&self, event_id: &str) -> bool {
        DeduplicationCache::release(self, event_id);
        true
    }
}

/// Handle to a running dedup sweeper task
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}
