//! Network layer for the Umbra mesh VPN
//!
//! Provides message-oriented transports over WebSocket: plain TCP for
//! listeners and dialers, TLS 1.3 with pinned self-signed certificates for
//! the direct peer-to-peer path, and a relay client that pairs two peers
//! through an untrusted broker.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod error;
pub mod transport;

// Re-exports
pub use backoff::BackoffConfig;
pub use error::NetworkError;
pub use transport::MessageTransport;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
