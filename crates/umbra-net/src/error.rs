//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed to establish
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// TLS error (handshake, certificate pinning)
    #[error("TLS error: {0}")]
    Tls(String),

    /// Relay broker error
    #[error("Relay error: {0}")]
    Relay(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The transport was closed by the peer
    #[error("Transport closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error is transient (worth a reconnect attempt)
    ///
    /// Connection resets, timeouts, and clean closes are transient; TLS
    /// pinning failures and relay pairing rejections are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Closed | Self::ConnectionFailed(_) => true,
            Self::Io(io_err) => is_transient_io(io_err),
            Self::WebSocket(_) => true,
            Self::Tls(_) | Self::Relay(_) => false,
        }
    }
}

/// Check whether a raw `std::io::Error` is transient
pub fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(NetworkError::Timeout.is_transient());
        assert!(NetworkError::Closed.is_transient());
        assert!(NetworkError::ConnectionFailed("reset".into()).is_transient());
        assert!(NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_transient());

        assert!(!NetworkError::Tls("pin mismatch".into()).is_transient());
        assert!(!NetworkError::Relay("pairing rejected".into()).is_transient());
        assert!(!NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied"
        ))
        .is_transient());
    }
}
