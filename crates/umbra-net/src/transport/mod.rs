//! Message-oriented transport implementations
//!
//! Every transport carries whole protocol messages (one WebSocket binary
//! frame per message) over a reliable bidirectional stream. The three
//! variants are plain WebSocket-over-TCP, WebSocket over pinned TLS for the
//! direct peer-to-peer path, and a relay-brokered WebSocket.

pub mod relay;
pub mod tls;
pub mod websocket;

use crate::Result;
use bytes::Bytes;
use std::net::SocketAddr;

pub use websocket::{WsListener, WsSink, WsSource, WsTransport};

/// Transport read/write buffer sizing (absorbs bursts without stalling TCP)
pub const TRANSPORT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Maximum size of a single transport message (header + payload)
pub const MAX_TRANSPORT_MESSAGE: usize = 16 * 1024 * 1024;

/// A reliable, message-oriented, bidirectional stream.
///
/// `recv` returning `Ok(None)` means the peer closed the transport cleanly.
#[allow(async_fn_in_trait)]
pub trait MessageTransport: Send {
    /// Send one message to the peer
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Receive one message from the peer (`None` on clean close)
    async fn recv(&mut self) -> Result<Option<Bytes>>;

    /// Close the transport, best-effort
    async fn close(&mut self);

    /// Remote socket address, if known
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Human-readable description of the transport for logging and status
    ///
    /// Examples: `"relay (ws://broker:4600)"`, `"direct+tls (192.0.2.7:51820)"`
    fn descriptor(&self) -> String;
}
