//! Redis-backed store.
//!
//! # Key layout
//!
//! For a queue named `q`:
//!
//! - `q`: pending list. Producers `LPUSH`, leases pop from the right, so
//!   delivery is FIFO. Reclaimed items are pushed back on the right and go
//!   out next.
//! - `q:processing`: hash of item id to serialized item for every leased item.
//! - `q:lease:<id>`: string holding the owning session id, with a `PX`
//!   expiry equal to the lease duration. Redis' own clock decides expiry.
//! - `q:deliveries`: hash of item id to delivery count.
//!
//! Lease, complete and reclaim run as Lua scripts, so each is atomic on the
//! server.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use super::{LeaseStore, lease_out_of_range, wall_clock_expiry};
use crate::error::{Error, Result};
use crate::model::{Item, ItemId, Lease, QueueStats, SessionId};

/// Pop one pending item, record it as processing and set the lease key.
///
/// KEYS: pending, processing, deliveries. ARGV: lease key prefix, session, ttl ms.
const LEASE_SCRIPT: &str = r#"
local raw = redis.call('RPOP', KEYS[1])
if not raw then
  return false
end
local id = cjson.decode(raw)['id']
redis.call('HSET', KEYS[2], id, raw)
redis.call('SET', ARGV[1] .. id, ARGV[2], 'PX', ARGV[3])
local deliveries = redis.call('HINCRBY', KEYS[3], id, 1)
return {raw, deliveries}
"#;

/// Delete the item only if the lease key still names the caller.
///
/// KEYS: processing, deliveries, lease key. ARGV: session, item id.
const COMPLETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[3]) ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[3])
redis.call('HDEL', KEYS[2], ARGV[2])
return redis.call('HDEL', KEYS[1], ARGV[2])
"#;

/// Move every processing item whose lease key has expired back to pending.
///
/// KEYS: pending, processing. ARGV: lease key prefix.
const RECLAIM_SCRIPT: &str = r#"
local entries = redis.call('HGETALL', KEYS[2])
local moved = 0
for i = 1, #entries, 2 do
  local id = entries[i]
  if redis.call('EXISTS', ARGV[1] .. id) == 0 then
    redis.call('HDEL', KEYS[2], id)
    redis.call('RPUSH', KEYS[1], entries[i + 1])
    moved = moved + 1
  end
end
return moved
"#;

/// What lives in the pending list. The delivery count is kept apart so the
/// serialized form never changes while an item moves between sets.
#[derive(Debug, Serialize, Deserialize)]
struct StoredItem {
    id: ItemId,
    payload: serde_json::Value,
    enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Item> for StoredItem {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            payload: item.payload.clone(),
            enqueued_at: item.enqueued_at,
        }
    }
}

/// Redis key names for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Keys {
    pending: String,
    processing: String,
    deliveries: String,
    lease_prefix: String,
}

impl Keys {
    fn for_queue(queue: &str) -> Self {
        Self {
            pending: queue.to_string(),
            processing: format!("{queue}:processing"),
            deliveries: format!("{queue}:deliveries"),
            lease_prefix: format!("{queue}:lease:"),
        }
    }

    fn lease(&self, id: ItemId) -> String {
        format!("{}{}", self.lease_prefix, id)
    }
}

/// Store backed by a Redis server.
pub struct RedisStore {
    /// Handles reconnection automatically; cloned per command.
    redis: ConnectionManager,
    lease: Script,
    complete: Script,
    reclaim: Script,
}

impl RedisStore {
    /// Connect to Redis, e.g. `redis://localhost:6379`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| Error::Connection(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self::from_connection(redis))
    }

    /// Build a store on an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            lease: Script::new(LEASE_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
        }
    }

    /// Delete every key belonging to `queue`, leases included.
    pub async fn clear(&self, queue: &str) -> Result<()> {
        let keys = Keys::for_queue(queue);
        let mut conn = self.redis.clone();

        let lease_keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(format!("{}*", keys.lease_prefix))
                .await?;
            let mut found = Vec::new();
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
            found
        };

        let mut pipe = redis::pipe();
        pipe.del(&keys.pending)
            .del(&keys.processing)
            .del(&keys.deliveries);
        for key in &lease_keys {
            pipe.del(key);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for RedisStore {
    async fn push(&self, queue: &str, item: &Item) -> Result<()> {
        let serialized = serde_json::to_string(&StoredItem::from(item))?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(queue, serialized).await?;
        Ok(())
    }

    async fn try_lease(
        &self,
        queue: &str,
        session: &SessionId,
        duration: Duration,
    ) -> Result<Option<Lease>> {
        let keys = Keys::for_queue(queue);
        let expires_at = wall_clock_expiry(duration)?;
        let ttl_ms = u64::try_from(duration.as_millis().max(1))
            .map_err(|_| lease_out_of_range(duration))?;
        let mut conn = self.redis.clone();

        let leased: Option<(String, u32)> = self
            .lease
            .key(&keys.pending)
            .key(&keys.processing)
            .key(&keys.deliveries)
            .arg(&keys.lease_prefix)
            .arg(session.as_str())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        let Some((raw, deliveries)) = leased else {
            return Ok(None);
        };

        let stored: StoredItem = serde_json::from_str(&raw)?;

        Ok(Some(Lease {
            item: Item {
                id: stored.id,
                payload: stored.payload,
                enqueued_at: stored.enqueued_at,
                deliveries,
            },
            session: session.clone(),
            expires_at,
        }))
    }

    async fn complete(&self, queue: &str, session: &SessionId, id: ItemId) -> Result<bool> {
        let keys = Keys::for_queue(queue);
        let mut conn = self.redis.clone();

        let removed: i64 = self
            .complete
            .key(&keys.processing)
            .key(&keys.deliveries)
            .key(keys.lease(id))
            .arg(session.as_str())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<usize> {
        let keys = Keys::for_queue(queue);
        let mut conn = self.redis.clone();

        let moved: usize = self
            .reclaim
            .key(&keys.pending)
            .key(&keys.processing)
            .arg(&keys.lease_prefix)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let keys = Keys::for_queue(queue);
        let mut conn = self.redis.clone();

        let (pending, leased): (usize, usize) = redis::pipe()
            .llen(&keys.pending)
            .hlen(&keys.processing)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            leased,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_queue() {
        let keys = Keys::for_queue("job2");
        let id: ItemId = "6f0f7b55-2c8e-4d7e-9a53-1b5f0b7a9c11".parse().unwrap();

        assert_eq!(keys.pending, "job2");
        assert_eq!(keys.processing, "job2:processing");
        assert_eq!(keys.deliveries, "job2:deliveries");
        assert_eq!(
            keys.lease(id),
            "job2:lease:6f0f7b55-2c8e-4d7e-9a53-1b5f0b7a9c11"
        );
    }

    #[test]
    fn stored_item_carries_the_id_the_scripts_read() {
        let item = Item::new(serde_json::json!({"n": 1}));
        let raw = serde_json::to_string(&StoredItem::from(&item)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["id"], serde_json::json!(item.id.to_string()));
        assert!(value.get("deliveries").is_none());
    }
}
