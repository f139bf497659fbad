//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The store URL may carry credentials, so it is wrapped in
//! secrecy::SecretString to keep it out of logs.

pub mod secrets;

use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    /// Backing store URL (`redis://`, `postgres://` or `memory://`).
    pub store_url: SecretString,
    pub queue_name: String,
    /// How long a lease stays valid without completion.
    pub lease_duration: Duration,
    /// How long a worker blocks on one lease call before re-checking emptiness.
    pub wait_timeout: Duration,
    /// Upper bound on a single wait slice while blocking.
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let lease_secs: u64 = parsed_var("LEASE_SECS", 10)?;
        if lease_secs == 0 {
            return Err(Error::Config("LEASE_SECS must be greater than zero".to_string()));
        }

        let poll_ms: u64 = parsed_var("POLL_INTERVAL_MS", 500)?;
        if poll_ms == 0 {
            return Err(Error::Config(
                "POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            store_url: SecretString::from(required_var("QUEUE_STORE_URL")?),
            queue_name: std::env::var("QUEUE_NAME").unwrap_or_else(|_| "work".to_string()),
            lease_duration: Duration::from_secs(lease_secs),
            wait_timeout: Duration::from_secs(parsed_var("LEASE_WAIT_SECS", 2)?),
            poll_interval: Duration::from_millis(poll_ms),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
