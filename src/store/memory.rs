//! In-process store.
//!
//! Implements the same atomic primitives as the networked stores behind a
//! single mutex. Lease deadlines use `tokio::time::Instant`, so tests can
//! pause and advance the clock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{LeaseStore, lease_out_of_range, wall_clock_expiry};
use crate::error::{Error, Result};
use crate::model::{Item, ItemId, Lease, QueueStats, SessionId};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Item>,
    leased: HashMap<ItemId, Held>,
}

struct Held {
    item: Item,
    session: SessionId,
    deadline: Instant,
}

impl QueueState {
    /// Move expired leases back to the head of the pending set.
    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<ItemId> = self
            .leased
            .iter()
            .filter(|(_, held)| held.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(held) = self.leased.remove(id) {
                self.pending.push_front(held.item);
            }
        }
        expired.len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leased.values().map(|held| held.deadline).min()
    }
}

/// Store backed by process memory. Shared across clients via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueState>>,
    work_ready: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>> {
        self.queues
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn push(&self, queue: &str, item: &Item) -> Result<()> {
        self.lock()?
            .entry(queue.to_string())
            .or_default()
            .pending
            .push_back(item.clone());
        self.work_ready.notify_waiters();
        Ok(())
    }

    async fn try_lease(
        &self,
        queue: &str,
        session: &SessionId,
        duration: Duration,
    ) -> Result<Option<Lease>> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        state.sweep(now);

        // Both clocks are checked before the pop; a failure leaves the item queued.
        let deadline = now
            .checked_add(duration)
            .ok_or_else(|| lease_out_of_range(duration))?;
        let expires_at = wall_clock_expiry(duration)?;

        let Some(mut item) = state.pending.pop_front() else {
            return Ok(None);
        };
        item.deliveries += 1;

        state.leased.insert(
            item.id,
            Held {
                item: item.clone(),
                session: session.clone(),
                deadline,
            },
        );

        Ok(Some(Lease {
            item,
            session: session.clone(),
            expires_at,
        }))
    }

    async fn complete(&self, queue: &str, session: &SessionId, id: ItemId) -> Result<bool> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };

        let owned = state
            .leased
            .get(&id)
            .is_some_and(|held| &held.session == session && held.deadline > Instant::now());

        if owned {
            state.leased.remove(&id);
        }
        Ok(owned)
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<usize> {
        let reclaimed = self
            .lock()?
            .get_mut(queue)
            .map(|state| state.sweep(Instant::now()))
            .unwrap_or(0);

        if reclaimed > 0 {
            self.work_ready.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let mut queues = self.lock()?;
        let (pending, leased) = match queues.get_mut(queue) {
            Some(state) => {
                state.sweep(Instant::now());
                (state.pending.len(), state.leased.len())
            }
            None => (0, 0),
        };
        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            leased,
        })
    }

    async fn wait_for_work(&self, queue: &str, max_wait: Duration) -> Result<()> {
        // Registered before the check below, so a push landing in between
        // still wakes this waiter.
        let notified = self.work_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // Also wake at the next lease deadline: an expiry makes work visible
        // without any push.
        let wait = {
            let queues = self.lock()?;
            match queues.get(queue) {
                Some(state) if !state.pending.is_empty() => return Ok(()),
                Some(state) => state
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                    .map_or(max_wait, |until_expiry| until_expiry.min(max_wait)),
                None => max_wait,
            }
        };

        if tokio::time::timeout(wait, notified).await.is_ok() {
            debug!(queue, "woken by new work");
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}
