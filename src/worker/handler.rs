//! What a worker does with each leased item.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::model::Item;

/// Processes one item. An `Err` leaves the item leased; it comes back after
/// the lease expires.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, item: &Item) -> Result<()>;
}

/// Stand-in for real work: sleeps for a fixed duration.
#[derive(Debug, Clone, Copy)]
pub struct SleepHandler {
    pub duration: Duration,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Handler for SleepHandler {
    async fn handle(&self, item: &Item) -> Result<()> {
        debug!(id = %item.id, payload = %item.payload, "working");
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Adapter that turns an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler. The closure receives an owned copy of the item.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, item: &Item) -> Result<()> {
        (self.0)(item.clone()).await
    }
}
