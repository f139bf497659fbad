//! Backing-store contract and implementations.
//!
//! The store is the single source of truth for queue state. Every primitive
//! here must be atomic with respect to other clients of the same store:
//! two concurrent `try_lease` calls never return the same item, and
//! `complete` only deletes when the caller still owns an unexpired lease.

pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;
pub use self::redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Item, ItemId, Lease, QueueStats, SessionId};

/// Primitives a lease queue needs from shared storage.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Append an item to the pending set.
    async fn push(&self, queue: &str, item: &Item) -> Result<()>;

    /// Atomically take one pending item and lease it to `session` for
    /// `duration`. `None` when nothing is pending.
    async fn try_lease(
        &self,
        queue: &str,
        session: &SessionId,
        duration: Duration,
    ) -> Result<Option<Lease>>;

    /// Delete the item if `session` holds an unexpired lease on it.
    /// Returns whether the delete happened.
    async fn complete(&self, queue: &str, session: &SessionId, id: ItemId) -> Result<bool>;

    /// Return items with expired leases to the pending set.
    async fn reclaim_expired(&self, queue: &str) -> Result<usize>;

    /// Count pending and leased items independently.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Park until work might be available, at most `max_wait`.
    ///
    /// Spurious early returns are fine; callers re-check the store.
    async fn wait_for_work(&self, _queue: &str, max_wait: Duration) -> Result<()> {
        tokio::time::sleep(max_wait).await;
        Ok(())
    }

    async fn health_check(&self) -> Result<()>;
}

/// Open a store from a URL, choosing the backend by scheme.
///
/// `postgres://` stores run their migrations before returning.
pub async fn connect(url: &str) -> Result<Arc<dyn LeaseStore>> {
    match Backend::from_url(url)? {
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
        Backend::Redis => Ok(Arc::new(RedisStore::connect(url).await?)),
        Backend::Postgres => {
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Wall-clock expiry of a lease of `duration` starting now.
///
/// Fails with [`Error::InvalidArgument`] when the deadline is not
/// representable, so stores can check before touching any state.
pub(crate) fn wall_clock_expiry(duration: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .ok_or_else(|| lease_out_of_range(duration))
}

pub(crate) fn lease_out_of_range(duration: Duration) -> Error {
    Error::InvalidArgument(format!("lease duration {duration:?} is out of range"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Memory,
    Redis,
    Postgres,
}

impl Backend {
    fn from_url(url: &str) -> Result<Self> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| Error::Config(format!("store URL has no scheme: {url}")))?;
        match scheme.as_str() {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(Error::Config(format!("unsupported store scheme: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_chosen_by_scheme() {
        assert_eq!(Backend::from_url("memory://").unwrap(), Backend::Memory);
        assert_eq!(
            Backend::from_url("redis://localhost:6379").unwrap(),
            Backend::Redis
        );
        assert_eq!(
            Backend::from_url("redis://:pw@cache.internal:6380/0").unwrap(),
            Backend::Redis
        );
        assert_eq!(
            Backend::from_url("POSTGRES://u:p@localhost/db").unwrap(),
            Backend::Postgres
        );
        assert_eq!(
            Backend::from_url("postgresql://localhost/db").unwrap(),
            Backend::Postgres
        );
    }

    #[test]
    fn unrepresentable_expiry_is_an_invalid_argument() {
        assert!(wall_clock_expiry(Duration::from_secs(60)).is_ok());
        assert!(matches!(
            wall_clock_expiry(Duration::from_secs(u64::MAX / 2)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            wall_clock_expiry(Duration::from_secs(10_000_000_000_000)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_or_missing_scheme_is_a_config_error() {
        assert!(matches!(
            Backend::from_url("amqp://localhost"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Backend::from_url("localhost:6379"),
            Err(Error::Config(_))
        ));
    }
}
