//! Relay client: WebSocket to an untrusted pairing broker
//!
//! The broker pairs exactly two clients that present the same pairing token
//! and forwards binary messages between them verbatim. It never sees
//! plaintext: handshake and data frames are opaque bytes end to end.

use crate::transport::websocket::WsTransport;
use crate::{NetworkError, Result};

/// Pairing token: an opaque 32-byte value both peers learn out of band
/// (typically from the discovery layer)
pub type PairingToken = [u8; 32];

/// Connect to a relay broker and join a pairing
///
/// # Arguments
///
/// * `broker_url` - Base URL of the broker, e.g. `ws://relay.example.net:4600`
/// * `token` - Pairing token shared with the peer
///
/// The broker holds the connection until the second peer arrives; message
/// exchange simply blocks until then. A broker that cannot pair closes the
/// transport, which surfaces as `Closed` on the next receive.
pub async fn connect(broker_url: &str, token: &PairingToken) -> Result<WsTransport> {
    let base = broker_url.trim_end_matches('/');
    if !base.starts_with("ws://") && !base.starts_with("wss://") {
        return Err(NetworkError::Relay(format!(
            "broker URL must be ws:// or wss://, got {}",
            broker_url
        )));
    }

    let url = format!("{}/pair?token={}", base, hex(token));
    let mut transport = WsTransport::dial(&url).await?;
    transport.set_descriptor(format!("relay ({})", base));

    Ok(transport)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
