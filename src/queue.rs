//! Worker-side handle to a named lease queue.
//!
//! Every call goes to the store; the client caches no queue state. Many
//! clients (one per worker) share a store and never talk to each other.
//!
//! Delivery is at-least-once. A lease that expires before
//! [`LeaseQueue::complete`] makes the item visible again, and another
//! session may process it too. Size the lease duration above the expected
//! processing time.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Item, ItemId, Lease, QueueStats, SessionId};
use crate::store::{self, LeaseStore};
use crate::telemetry::metrics;

/// Default upper bound on a single wait while blocking in [`LeaseQueue::lease`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Smallest accepted poll interval; shorter values are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest lease a client will request (one year).
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Client for one queue, bound to one worker session.
#[derive(Clone)]
pub struct LeaseQueue {
    store: Arc<dyn LeaseStore>,
    name: String,
    session: SessionId,
    poll_interval: Duration,
}

impl LeaseQueue {
    /// Create a client over an injected store with a fresh session id.
    pub fn new(name: impl Into<String>, store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            name: name.into(),
            session: SessionId::generate(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Connect to the store at `store_url` (see [`store::connect`]).
    pub async fn connect(name: impl Into<String>, store_url: &str) -> Result<Self> {
        let store = store::connect(store_url).await?;
        Ok(Self::new(name, store))
    }

    /// Bound on a single wait slice while blocking, at least [`MIN_POLL_INTERVAL`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This client's session, fixed for its lifetime.
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// The underlying store, for sharing with other clients.
    pub fn store(&self) -> Arc<dyn LeaseStore> {
        Arc::clone(&self.store)
    }

    /// True iff nothing is pending AND nothing is leased.
    ///
    /// Leased items count: a crashed worker's lease may still expire and put
    /// its item back. Even so, a `true` here can be stale by the time the
    /// caller acts on it; at-least-once queues cannot close that window.
    pub async fn empty(&self) -> Result<bool> {
        Ok(self.stats().await?.is_empty())
    }

    /// Pending and leased counts.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats(&self.name).await
    }

    /// Add an item to the queue. Returns its id.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<ItemId> {
        let item = Item::new(payload);
        self.store.push(&self.name, &item).await?;
        self.record("enqueue");
        debug!(queue = %self.name, id = %item.id, "enqueued");
        Ok(item.id)
    }

    /// Lease one item for `lease_duration`.
    ///
    /// `lease_duration` must be positive and at most [`MAX_LEASE_DURATION`].
    /// With `block == false`, returns `None` immediately if nothing is
    /// pending. With `block == true`, waits until an item is available or
    /// `timeout` elapses (`None` waits indefinitely) and returns `None` on
    /// timeout. Dropping the returned future cancels the wait.
    pub async fn lease(
        &self,
        lease_duration: Duration,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Lease>> {
        if lease_duration.is_zero() {
            return Err(Error::InvalidArgument(
                "lease duration must be positive".to_string(),
            ));
        }
        if lease_duration > MAX_LEASE_DURATION {
            return Err(Error::InvalidArgument(format!(
                "lease duration {lease_duration:?} exceeds the {MAX_LEASE_DURATION:?} maximum"
            )));
        }

        let started = Instant::now();
        let deadline = timeout.filter(|_| block).map(|t| started + t);

        loop {
            self.reclaim_expired().await?;

            if let Some(lease) = self
                .store
                .try_lease(&self.name, &self.session, lease_duration)
                .await?
            {
                self.record("lease");
                metrics::lease_wait_ms().record(
                    started.elapsed().as_secs_f64() * 1000.0,
                    &[KeyValue::new("queue", self.name.clone())],
                );
                if lease.item.is_redelivery() {
                    info!(
                        queue = %self.name,
                        id = %lease.id(),
                        deliveries = lease.item.deliveries,
                        "leased re-delivered item"
                    );
                }
                return Ok(Some(lease));
            }

            if !block {
                self.record("lease_empty");
                return Ok(None);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.record("lease_timeout");
                        debug!(queue = %self.name, "lease wait timed out");
                        return Ok(None);
                    }
                    (deadline - now).min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            self.store.wait_for_work(&self.name, wait).await?;
        }
    }

    /// Delete a leased item, if this session's lease on it is still valid.
    ///
    /// `false` means the lease expired first (or was never ours): the item
    /// is, or will be, visible to other workers again. Expected under
    /// at-least-once delivery, so it is logged rather than raised.
    pub async fn complete(&self, lease: &Lease) -> Result<bool> {
        let completed = self
            .store
            .complete(&self.name, &self.session, lease.id())
            .await?;

        if completed {
            self.record("complete");
        } else {
            self.record("complete_expired");
            warn!(
                queue = %self.name,
                id = %lease.id(),
                session = %self.session,
                "lease expired before completion, item may be processed again"
            );
        }
        Ok(completed)
    }

    /// Return expired leases to the pending set. Also runs before every
    /// lease attempt.
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let reclaimed = self.store.reclaim_expired(&self.name).await?;
        if reclaimed > 0 {
            metrics::leases_reclaimed().add(
                reclaimed as u64,
                &[KeyValue::new("queue", self.name.clone())],
            );
            info!(queue = %self.name, reclaimed, "reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

impl std::fmt::Debug for LeaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseQueue")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
