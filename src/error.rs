//! Error types for the DNS router.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::dns::{DnsRecord, ResponseCode};

/// Main error type for router startup and wiring.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("failed to read domain list {path:?}: {source}")]
    ReadList {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("dns.timeout_ms must be greater than 0")]
    ZeroUpstreamTimeout,

    #[error("doh.timeout_ms must be greater than 0")]
    ZeroDohTimeout,

    #[error("cache.capacity must be greater than 0")]
    ZeroCacheCapacity,

    #[error("ttl.max must be greater than 0")]
    ZeroMaxTtl,

    #[error("ttl.min ({min}) must not exceed ttl.max ({max})")]
    TtlRange { min: u32, max: u32 },

    #[error("either doh.circumvention or dns.remote must be set")]
    NoCircumventionUpstream,

    #[error("{field} must start with http:// or https://: {url:?}")]
    InvalidUrl { field: &'static str, url: String },

    #[error("router.user cannot be empty")]
    EmptyRouterUser,

    #[error("router.list_name cannot be empty")]
    EmptyRouterList,
}

/// Failure of a single upstream resolver transaction.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream query timed out")]
    Timeout,

    #[error("upstream transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("malformed upstream response")]
    Malformed,

    #[error("upstream answered {code}")]
    Response {
        code: ResponseCode,
        records: Vec<DnsRecord>,
    },

    #[error("no free transaction id")]
    Exhausted,

    #[error("upstream correlator closed")]
    Closed,
}

impl UpstreamError {
    /// The response code to propagate to the client, if the upstream gave one.
    pub fn code(&self) -> Option<ResponseCode> {
        match self {
            UpstreamError::Response { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// DNS-over-HTTPS lookup failures.
#[derive(Debug, Error)]
pub enum DohError {
    #[error("DoH request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("DoH server returned HTTP {0}")]
    Status(u16),
}

/// Address-list synchronization failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("router request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
