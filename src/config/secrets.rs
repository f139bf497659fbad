//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for logging values that
//! may embed credentials.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a store URL with any `user:password@` part masked.
///
/// `redis://:hunter2@cache:6379/0` becomes `redis://***@cache:6379/0`.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***{}", &rest[at..]),
        None => raw.to_string(),
    }
}
