//! Error types for the platform client and the config emitter.

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the orchestration platform's query API.
///
/// Any of these aborts a rebuild as a unit.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid url {0}")]
    Url(String),
}

/// Failures rendering or installing a proxy configuration.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to render configuration: {0}")]
    Render(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start reload command `{command}`: {source}")]
    Reload {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;
pub type EmitResult<T> = std::result::Result<T, EmitError>;
