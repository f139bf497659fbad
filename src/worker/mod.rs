//! Worker loop: lease, handle, complete, repeat.
//!
//! Connection errors are retried with exponential backoff. An empty lease
//! just polls again. A completion that lost its lease is counted and
//! logged, never fatal.
//!
//! With `exit_when_empty`, the worker stops once [`LeaseQueue::empty`]
//! reports nothing pending or leased. Another worker's lease can still
//! expire afterwards and put an item back; that item waits for the next
//! worker. This is inherent to at-least-once delivery.

pub mod handler;

pub use handler::{FnHandler, Handler, SleepHandler, handler_fn};

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{Instrument, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Lease;
use crate::queue::LeaseQueue;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_work_span};

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease duration requested for each item. Must exceed handling time.
    pub lease_duration: Duration,
    /// How long one blocking lease call waits before the loop re-checks.
    pub wait_timeout: Duration,
    /// Stop once the queue has nothing pending or leased.
    pub exit_when_empty: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(2),
            exit_when_empty: true,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease_duration: config.lease_duration,
            wait_timeout: config.wait_timeout,
            ..Self::default()
        }
    }
}

/// Counts of how items ended during one [`Worker::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Handled and deleted.
    pub completed: u64,
    /// Handled, but the lease had expired by completion time.
    pub expired: u64,
    /// Handler returned an error; left for re-delivery.
    pub failed: u64,
}

/// One worker: a queue client, a handler and a shutdown signal.
pub struct Worker<H> {
    queue: LeaseQueue,
    handler: Arc<H>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl<H> Clone for Worker<H> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<H: Handler> Worker<H> {
    pub fn new(queue: LeaseQueue, handler: H, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn queue(&self) -> &LeaseQueue {
        &self.queue
    }

    /// Signal the worker to stop. An item being handled is finished first.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until the queue is empty (if configured) or shutdown.
    pub async fn run(&self) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        info!(
            queue = self.queue.name(),
            session = %self.queue.session_id(),
            "worker started"
        );
        match self.queue.empty().await {
            Ok(empty) => info!(empty, "initial queue state"),
            Err(e) if e.is_connection() => warn!("initial queue state unknown: {e}"),
            Err(e) => return Err(e),
        }

        loop {
            if self.config.exit_when_empty {
                match self.queue.empty().await {
                    Ok(true) => {
                        info!("queue empty, exiting");
                        break;
                    }
                    Ok(false) => {}
                    Err(e) if e.is_connection() => {
                        if self.back_off(&mut backoff, &e).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let leased = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    break;
                }
                leased = self.queue.lease(
                    self.config.lease_duration,
                    true,
                    Some(self.config.wait_timeout),
                ) => leased,
            };

            let outcome = match leased {
                Ok(Some(lease)) => self.process(lease, &mut report).await,
                Ok(None) => {
                    info!("waiting for work");
                    Ok(())
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => backoff.reset(),
                Err(e) if e.is_connection() => {
                    if self.back_off(&mut backoff, &e).await {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            completed = report.completed,
            expired = report.expired,
            failed = report.failed,
            "worker stopped"
        );
        Ok(report)
    }

    /// Handle one leased item and retire it.
    async fn process(&self, lease: Lease, report: &mut WorkerReport) -> Result<()> {
        let span = start_work_span(self.queue.name(), self.queue.session_id(), &lease);

        async {
            info!(payload = %lease.item.payload, "working on item");
            let started = Instant::now();
            let handled = self.handler.handle(&lease.item).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let result = match handled {
                Ok(()) => {
                    if self.queue.complete(&lease).await? {
                        report.completed += 1;
                        "completed"
                    } else {
                        report.expired += 1;
                        "expired"
                    }
                }
                Err(e) => {
                    warn!(error = %e, "handler failed, item will be re-delivered after lease expiry");
                    report.failed += 1;
                    "failed"
                }
            };

            record_outcome(&span, result, duration_ms);
            metrics::work_duration_ms().record(
                duration_ms as f64,
                &[
                    KeyValue::new("queue", self.queue.name().to_string()),
                    KeyValue::new("result", result),
                ],
            );
            Ok(())
        }
        .instrument(span.clone())
        .await
    }

    /// Sleep out the next backoff delay. Returns true if shutdown arrived
    /// meanwhile.
    async fn back_off(&self, backoff: &mut Backoff, error: &Error) -> bool {
        let delay = backoff.next_delay();
        warn!(
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "store unavailable, backing off"
        );
        tokio::select! {
            _ = self.shutdown.notified() => {
                info!("worker shutting down");
                true
            }
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Exponential backoff, doubling up to a cap.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}
