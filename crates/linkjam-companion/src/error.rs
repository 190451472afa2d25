//! Error types for the companion.
//!
//! One enum covers the authority channel, the REST fallback, the local
//! tempo engine and configuration. None of these are fatal to the process:
//! the coordinator maps each to a scheduler state and the binary decides
//! whether to retry.

use linkjam_core::config::ConfigError;
use linkjam_types::DecodeError;

/// Errors that can occur during companion operation.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Failed to open the authority channel.
    #[error("connect error: {0}")]
    Connect(String),

    /// The authority channel failed or closed while in use.
    #[error("channel error: {0}")]
    Channel(String),

    /// An operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// The local tempo engine rejected a command or is unreachable.
    #[error("tempo engine error: {0}")]
    Engine(String),

    /// A channel frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),

    /// The REST state fetch failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration is invalid or missing.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CompanionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
