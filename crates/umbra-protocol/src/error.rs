//! Protocol error types
//!
//! Variants map onto the recovery policy: `Malformed`, `Crypto`, and
//! `Violation` are fatal for the connection and never retried; `Replay` is
//! absorbed with a counter; transport errors are retried by the connection
//! manager when transient.

use thiserror::Error;
use umbra_net::NetworkError;

/// Protocol-layer errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Wire bytes do not parse (bad length, truncated, length mismatch)
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Peer speaks an unknown protocol version
    #[error("Unsupported protocol version: {0}")]
    VersionUnsupported(u8),

    /// Signature, decapsulation, AEAD, or proof failure
    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    /// Message unexpected in the current state, or unknown required type
    #[error("Protocol violation: {0}")]
    Violation(String),

    /// Frame counter already seen or below the replay window
    #[error("Replayed frame: counter {0}")]
    Replay(u64),

    /// Plaintext frame exceeds the negotiated MTU
    #[error("Frame exceeds MTU: {size} > {mtu}")]
    FrameTooLarge {
        /// Offered frame size
        size: usize,
        /// Negotiated MTU
        mtu: usize,
    },

    /// The TX counter is exhausted; a re-handshake must run first
    #[error("Key rotation required before further frames")]
    RotationRequired,

    /// The bounded send queue is full; backpressure surfaced to the caller
    #[error("Send buffer full")]
    SendBufferFull,

    /// Handshake did not complete within its deadline
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Peer requires a capability this node does not support
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Peer rejected by the local authorization policy
    #[error("Policy rejected peer: {0}")]
    PolicyRejected(String),

    /// Listener at capacity
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The connection is closed
    #[error("Connection closed")]
    Closed,

    /// Underlying transport error
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl From<umbra_crypto::CryptoError> for ProtocolError {
    fn from(e: umbra_crypto::CryptoError) -> Self {
        ProtocolError::Crypto(e.to_string())
    }
}

impl ProtocolError {
    /// Whether the connection manager may recover from this error by
    /// reconnecting.
    ///
    /// Only transport-level failures qualify. Cryptographic and protocol
    /// violations never recover, and a blown handshake deadline closes the
    /// connection instead of redialing — unlike a missed heartbeat, which
    /// reconnects.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_errors_are_fatal() {
        assert!(!ProtocolError::Crypto("bad proof".into()).is_transient());
        assert!(!ProtocolError::Malformed("truncated".into()).is_transient());
        assert!(!ProtocolError::Violation("unexpected HELLO".into()).is_transient());
    }

    #[test]
    fn test_handshake_timeout_closes_instead_of_reconnecting() {
        assert!(!ProtocolError::HandshakeTimeout.is_transient());
    }

    #[test]
    fn test_transport_errors_follow_network_classification() {
        assert!(ProtocolError::Network(NetworkError::Timeout).is_transient());
        assert!(!ProtocolError::Network(NetworkError::Tls("pin".into())).is_transient());
    }
}
