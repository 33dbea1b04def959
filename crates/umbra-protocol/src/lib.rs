//! Umbra protocol core
//!
//! The data-plane and session core of the mesh VPN: typed wire messages with
//! a fixed header, the four-message hybrid post-quantum handshake, the
//! per-session frame pipeline (AEAD, replay window, key rotation), the
//! connection manager (dial, listen, reconnect, heartbeat, relay→direct
//! migration), and the router that moves frames between the virtual NIC and
//! the encrypted transport.

#![forbid(unsafe_code)]

pub mod capability;
pub mod conn;
pub mod error;
pub mod handshake;
pub mod nic;
pub mod node;
pub mod router;
pub mod session;
pub mod wire;

pub use error::ProtocolError;
pub use node::{ConnectRequest, Node};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
