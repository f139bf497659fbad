//! Core data model.
//!
//! An item is a payload waiting in a named queue. A lease is one session's
//! temporary, time-bounded claim on an item. The queue is empty only when it
//! holds neither pending nor leased items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A unit of work stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier, assigned at enqueue.
    pub id: ItemId,

    /// Arbitrary payload. The queue doesn't interpret it.
    pub payload: serde_json::Value,

    pub enqueued_at: DateTime<Utc>,

    /// How many times this item has been leased, including the current one.
    /// Anything above 1 is a re-delivery after an expired lease.
    #[serde(default)]
    pub deliveries: u32,
}

impl Item {
    /// A fresh, never-delivered item.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: ItemId::new(),
            payload,
            enqueued_at: Utc::now(),
            deliveries: 0,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.deliveries > 1
    }
}

/// Newtype for item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Identity of one worker process instance. Proves lease ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate `<hostname>-<random suffix>`.
    pub fn generate() -> Self {
        Self(format!("{}-{}", hostname(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A session's claim on an item, valid until `expires_at`.
///
/// The expiry is enforced by the store's clock; `expires_at` is the
/// client's best view of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub item: Item,
    pub session: SessionId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn id(&self) -> ItemId {
        self.item.id
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    /// Visible to any worker.
    pub pending: usize,
    /// Held by some session (possibly expired but not yet swept).
    pub leased: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.leased
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
