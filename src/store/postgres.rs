//! Postgres-backed store.
//!
//! One row per item in `lease_queue_items`. Leasing is a single
//! `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)`, so concurrent
//! workers never pick the same row. Expiry is judged against the database's
//! `now()`: a row whose lease has run out is pending again even before
//! [`LeaseStore::reclaim_expired`] clears its owner.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::LeaseStore;
use crate::error::Result;
use crate::model::{Item, ItemId, Lease, QueueStats, SessionId};

/// NOTIFY channel signalled on every push. The payload is the queue name.
const NOTIFY_CHANNEL: &str = "lease_queue";

/// Pause before reopening a failed listener connection.
const LISTENER_RETRY: Duration = Duration::from_secs(1);

/// Store backed by a Postgres connection pool.
///
/// One background task per store holds the `LISTEN` connection and wakes
/// every waiter on each notification, so clients sharing the store never
/// queue behind each other's waits.
pub struct PgStore {
    pool: PgPool,
    work_ready: Arc<Notify>,
    /// Spawned on first wait, aborted on drop.
    listener: OnceLock<JoinHandle<()>>,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Build a store on an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            work_ready: Arc::new(Notify::new()),
            listener: OnceLock::new(),
        }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Delete every item of `queue`, leased or not.
    pub async fn clear(&self, queue: &str) -> Result<()> {
        sqlx::query("DELETE FROM lease_queue_items WHERE queue_name = $1")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PgStore {
    async fn push(&self, queue: &str, item: &Item) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO lease_queue_items (id, queue_name, payload, enqueued_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(item.id.0)
        .bind(queue)
        .bind(&item.payload)
        .bind(item.enqueued_at)
        .execute(&mut *tx)
        .await?;

        // Delivered on commit, so waiters never see the notification first.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(queue)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn try_lease(
        &self,
        queue: &str,
        session: &SessionId,
        duration: Duration,
    ) -> Result<Option<Lease>> {
        let row = sqlx::query_as::<
            _,
            (
                Uuid,
                serde_json::Value,
                chrono::DateTime<chrono::Utc>,
                i32,
                chrono::DateTime<chrono::Utc>,
            ),
        >(
            "UPDATE lease_queue_items
             SET lease_owner = $2,
                 lease_expires_at = now() + make_interval(secs => $3),
                 deliveries = deliveries + 1
             WHERE id = (
                 SELECT id FROM lease_queue_items
                 WHERE queue_name = $1
                   AND (lease_owner IS NULL OR lease_expires_at <= now())
                 ORDER BY seq
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, payload, enqueued_at, deliveries, lease_expires_at",
        )
        .bind(queue)
        .bind(session.as_str())
        .bind(duration.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, payload, enqueued_at, deliveries, expires_at)| Lease {
                item: Item {
                    id: ItemId(id),
                    payload,
                    enqueued_at,
                    deliveries: deliveries.max(0) as u32,
                },
                session: session.clone(),
                expires_at,
            },
        ))
    }

    async fn complete(&self, queue: &str, session: &SessionId, id: ItemId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "DELETE FROM lease_queue_items
             WHERE queue_name = $1 AND id = $2
               AND lease_owner = $3 AND lease_expires_at > now()",
        )
        .bind(queue)
        .bind(id.0)
        .bind(session.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<usize> {
        let rows_affected = sqlx::query(
            "UPDATE lease_queue_items
             SET lease_owner = NULL, lease_expires_at = NULL
             WHERE queue_name = $1 AND lease_owner IS NOT NULL AND lease_expires_at <= now()",
        )
        .bind(queue)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected as usize)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let (pending, leased): (i64, i64) = sqlx::query_as(
            "SELECT count(*) FILTER (WHERE lease_owner IS NULL),
                    count(*) FILTER (WHERE lease_owner IS NOT NULL)
             FROM lease_queue_items WHERE queue_name = $1",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            queue: queue.to_string(),
            pending: pending as usize,
            leased: leased as usize,
        })
    }

    async fn wait_for_work(&self, queue: &str, max_wait: Duration) -> Result<()> {
        self.listener.get_or_init(|| {
            tokio::spawn(relay_notifications(
                self.pool.clone(),
                Arc::clone(&self.work_ready),
            ))
        });

        if tokio::time::timeout(max_wait, self.work_ready.notified())
            .await
            .is_ok()
        {
            debug!(queue, "woken by new work");
        }
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get() {
            listener.abort();
        }
    }
}

/// Forward every notification on [`NOTIFY_CHANNEL`] to all waiters,
/// reconnecting after errors. Waiters poll meanwhile.
async fn relay_notifications(pool: PgPool, work_ready: Arc<Notify>) {
    loop {
        if let Err(e) = listen(&pool, &work_ready).await {
            warn!("PgListener error: {e}, falling back to poll");
        }
        tokio::time::sleep(LISTENER_RETRY).await;
    }
}

async fn listen(pool: &PgPool, work_ready: &Notify) -> Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(NOTIFY_CHANNEL).await?;
    loop {
        let notification = listener.recv().await?;
        debug!(queue = notification.payload(), "notified of new work");
        work_ready.notify_waiters();
    }
}
