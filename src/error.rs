//! Error types for leaseq.
//!
//! Only infrastructure failures are errors. Expected races (an expired lease
//! on completion, an empty queue, a blocking lease timing out) are ordinary
//! return values on [`crate::queue::LeaseQueue`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("malformed item: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this failure means the backing store could not be reached.
    ///
    /// Callers treat these as retryable; everything else is a bug or a
    /// misconfiguration.
    pub fn is_connection(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
