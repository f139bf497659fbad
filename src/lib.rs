//! # leaseq
//!
//! Lease-based distributed work queue client.
//!
//! Workers lease items from a shared store with a visibility timeout and
//! complete them when done. A lease that expires without completion puts
//! the item back for another worker (at-least-once delivery). Stores:
//! in-memory, Redis, and Postgres.

pub mod config;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
pub use model::{Item, ItemId, Lease, QueueStats, SessionId};
pub use queue::LeaseQueue;
pub use store::LeaseStore;
