//! Error types for consul-dns.

use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur in the DNS server.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error talking to the Consul agent.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The upstream returned a non-200 response.
    #[error("GET {url}: {status}")]
    UnexpectedStatus {
        /// The request URL.
        url: String,
        /// The response status.
        status: reqwest::StatusCode,
    },

    /// JSON decoding error.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// HTTP/1 connection error (container endpoint).
    #[error("HTTP connection error: {0}")]
    Hyper(#[from] hyper::Error),

    /// Malformed HTTP request (container endpoint).
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] hyper::http::Error),

    /// An operation did not complete within its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// The outcome of a failed service lookup, as served from the cache.
///
/// Negative cache entries hand the same stored error to every caller until
/// they expire, so the upstream cause is reference counted rather than
/// rebuilt per lookup.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// The fetch from the Consul agent failed; memoised until the entry
    /// expires.
    #[error("consul fetch failed: {0}")]
    Upstream(#[source] Arc<Error>),

    /// The caller's context was cancelled while waiting for the entry.
    #[error("lookup cancelled")]
    Cancelled,
}
