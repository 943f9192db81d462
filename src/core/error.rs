//! Error types for tunnel operations.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the rendezvous, bridge, and balancer components.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The worker serving a job disconnected or returned malformed data.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    /// A bounded wait elapsed before completion.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// A provisioning request was rejected.
    #[error("invalid provision: {0}")]
    InvalidProvision(String),
    /// A frame could not be decoded from the byte stream.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// A frame exceeded the configured size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Size announced or accumulated so far.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Configuration failed validation.
    #[error("config error: {0}")]
    Config(String),
    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether this error is a client-visible upstream failure.
    #[must_use]
    pub const fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamFailure(_))
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
