//! Listener role: accept transports, run responder handshakes, register clients

use crate::conn::{driver, Connection, ConnectionConfig};
use crate::handshake::PeerVerifier;
use crate::wire::codec;
use crate::wire::messages::{error_code, ErrorMessage, Message};
use crate::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use umbra_crypto::{IdentityKeyPair, NodeId};
use umbra_net::transport::{MessageTransport, WsListener};

/// Default cap on concurrently connected clients
pub const DEFAULT_MAX_CLIENTS: usize = 256;

/// Accepts incoming transports and runs responder handshakes
///
/// Established connections are registered by peer NodeID; the registry is
/// pruned of closed connections on every accept. At capacity, new upgrades
/// are rejected with a service-unavailable error before any handshake work.
pub struct MeshListener {
    listener: WsListener,
    identity: Arc<IdentityKeyPair>,
    verifier: Arc<dyn PeerVerifier>,
    config: ConnectionConfig,
    max_clients: usize,
    registry: Arc<RwLock<HashMap<NodeId, Arc<Connection>>>>,
}

impl MeshListener {
    /// Bind a listener
    pub async fn bind(
        addr: SocketAddr,
        identity: Arc<IdentityKeyPair>,
        verifier: Arc<dyn PeerVerifier>,
        config: ConnectionConfig,
        max_clients: usize,
    ) -> Result<Self> {
        let listener = WsListener::bind(addr).await?;
        info!(addr = %listener.local_addr(), max_clients, "mesh listener bound");

        Ok(Self {
            listener,
            identity,
            verifier,
            config,
            max_clients,
            registry: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// The bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Accept the next client; loops past failed handshakes and rejected
    /// upgrades so one bad peer cannot stall the accept loop
    pub async fn accept(&self) -> Result<Arc<Connection>> {
        loop {
            let mut transport = self.listener.accept().await?;
            self.prune_closed();

            if self.client_count() >= self.max_clients {
                warn!(max = self.max_clients, "listener at capacity, rejecting client");
                let message = Message::Error(ErrorMessage {
                    code: error_code::SERVICE_UNAVAILABLE,
                    message: "service unavailable".to_string(),
                });
                let _ = transport.send(codec::encode(&message, 0, 0)).await;
                transport.close().await;
                continue;
            }

            match driver::accept_connection(
                self.identity.clone(),
                self.verifier.clone(),
                transport,
                self.config.clone(),
                false,
            )
            .await
            {
                Ok(connection) => {
                    if let Some(peer_id) = connection.peer_id() {
                        self.register(peer_id, connection.clone());
                        return Ok(connection);
                    }
                    // Handshake succeeded but the session vanished already
                    connection.close().await;
                }
                Err(e) => {
                    warn!("responder handshake failed: {}", e);
                }
            }
        }
    }

    /// Look up a registered connection by peer NodeID
    pub fn connection(&self, peer: &NodeId) -> Option<Arc<Connection>> {
        self.registry.read().ok()?.get(peer).cloned()
    }

    /// Number of registered (live) clients
    pub fn client_count(&self) -> usize {
        self.registry.read().map(|r| r.len()).unwrap_or(0)
    }

    fn register(&self, peer: NodeId, connection: Arc<Connection>) {
        if let Ok(mut registry) = self.registry.write() {
            if let Some(previous) = registry.insert(peer, connection) {
                // A reconnecting peer supersedes its old registration
                previous.cancel.cancel();
            }
        }
    }

    fn prune_closed(&self) {
        if let Ok(mut registry) = self.registry.write() {
            registry.retain(|_, conn| conn.state() != crate::conn::ConnState::Closed);
        }
    }
}

impl std::fmt::Debug for MeshListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshListener")
            .field("addr", &self.listener.local_addr())
            .field("clients", &self.client_count())
            .field("max_clients", &self.max_clients)
            .finish()
    }
}
