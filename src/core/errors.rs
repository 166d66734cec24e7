// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// A failure of the cloud provider snapshot as a whole (authentication,
    /// full API outage). Per-instance lookup failures are absorbed inside the
    /// discovery clients and never surface as this variant.
    #[error("Cloud discovery error: {0}")]
    Cloud(String),

    /// Any HTTP error from the Dataplane API other than 409.
    #[error("Dataplane API error: HTTP {status}: {body}")]
    Dataplane { status: u16, body: String },

    /// HTTP 409 from the Dataplane API: the configuration version changed
    /// between the transaction open and the commit.
    #[error("Dataplane configuration version conflict")]
    VersionConflict,

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(e: reqwest::Error) -> Self {
        DiscoveryError::HttpClient(e.to_string())
    }
}
