//! Error types for StreamVault
//!
//! One crate-wide error enum. The streaming engine handles the recoverable
//! kinds internally; everything else propagates to the HTTP surface or the
//! bot conversation.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in StreamVault
#[derive(Debug, Error)]
pub enum Error {
    /// Record or upstream message does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Range header is malformed or outside the file
    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    /// Upstream file reference went stale; must re-fetch the message
    #[error("file reference expired")]
    ReferenceExpired,

    /// A single blob fetch exceeded the configured timeout
    #[error("blob fetch timed out")]
    BlobTimeout,

    /// Transient network failure talking to the upstream
    #[error("transient network error: {0}")]
    NetworkTransient(String),

    /// Upstream rate limiter told us to back off
    #[error("flood limited for {0}s")]
    FloodLimited(u32),

    /// Credentials rejected by the upstream
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Upstream blob sequence ended before the range was satisfied
    #[error("stream ended {remaining} bytes early")]
    PrematureEof { remaining: u64 },

    /// Self-heal exhausted its retry budget mid-stream
    #[error("stream broken after {attempts} recovery attempts")]
    StreamBroken { attempts: u32 },

    /// HTTP client went away mid-stream
    #[error("client disconnected")]
    ClientDisconnect,

    /// Metadata database failure
    #[error("database error: {0}")]
    Database(String),

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Any other upstream protocol error
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Ingest-path failure with a user-visible reason
    #[error("{0}")]
    Ingest(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Kinds the stream engine retries inside its self-heal loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ReferenceExpired
                | Error::BlobTimeout
                | Error::NetworkTransient(_)
                | Error::FloodLimited(_)
        )
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(e: mongodb::error::Error) -> Self {
        Error::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(Error::ReferenceExpired.is_recoverable());
        assert!(Error::BlobTimeout.is_recoverable());
        assert!(Error::NetworkTransient("reset".into()).is_recoverable());
        assert!(Error::FloodLimited(10).is_recoverable());

        assert!(!Error::NotFound("x".into()).is_recoverable());
        assert!(!Error::RangeNotSatisfiable.is_recoverable());
        assert!(!Error::Unauthorized("bad token".into()).is_recoverable());
        assert!(!Error::PrematureEof { remaining: 42 }.is_recoverable());
    }
}
