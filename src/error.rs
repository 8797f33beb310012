use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Everything that can permanently kill a stream.
///
/// All variants except [`StreamError::Closed`] are fatal protocol or
/// environment failures: once one is raised the stream records it and every
/// subsequent `pump()` returns the same error without doing further work.
/// `Closed` is the terminal status of a graceful shutdown and carries no
/// failure semantics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Encryption or decryption reported failure (tag mismatch, key misuse).
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Payload shorter than the reliable header, magic mismatch, or a
    /// malformed initial-data block.
    #[error("framing failure: {0}")]
    Framing(String),

    /// The peer did something the protocol forbids, e.g. a sequenced packet
    /// outside the Established state or an unknown opcode.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The underlying datagram endpoint failed to send or receive.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The stream finished a graceful close; no further work will be done.
    #[error("stream closed")]
    Closed,
}

impl StreamError {
    pub fn crypto(reason: impl Into<String>) -> Self {
        Self::Crypto(reason.into())
    }

    pub fn framing(reason: impl Into<String>) -> Self {
        Self::Framing(reason.into())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }

    /// True for the graceful-close terminal status, false for real failures.
    #[must_use]
    pub const fn is_graceful(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_reason() {
        let err = StreamError::crypto("authentication tag mismatch");
        assert!(err.to_string().contains("authentication tag mismatch"));
    }

    #[test]
    fn test_graceful_classification() {
        assert!(StreamError::Closed.is_graceful());
        assert!(!StreamError::framing("bad magic").is_graceful());
    }
}
