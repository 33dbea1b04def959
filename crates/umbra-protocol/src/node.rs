//! Control surface consumed by the external control layer
//!
//! Three operations: connect, disconnect, status. The transport of the
//! control API (HTTP, IPC) lives outside the core; the CLI drives this
//! directly.

use crate::conn::{
    ConnState, ConnectMode, Connection, ConnectionConfig, PeerConfig, StatusSnapshot,
};
use crate::nic::VirtualNic;
use crate::router::Router;
use crate::{ProtocolError, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use umbra_crypto::sig::HybridPublicKey;
use umbra_crypto::{IdentityKeyPair, NodeId};

/// Parameters for [`Node::connect`]
#[derive(Clone)]
pub struct ConnectRequest {
    /// Expected peer NodeID
    pub peer_id: NodeId,
    /// Trusted peer identity key (from discovery or pinning)
    pub peer_key: HybridPublicKey,
    /// Direct dial or relay meeting point
    pub mode: ConnectMode,
}

struct ActiveTunnel {
    conn: Arc<Connection>,
    router: Router,
}

/// The node: identity plus at most one active tunnel (single-peer core)
pub struct Node {
    identity: Arc<IdentityKeyPair>,
    config: ConnectionConfig,
    active: Mutex<Option<ActiveTunnel>>,
}

impl Node {
    /// Create a node from a loaded identity
    pub fn new(identity: Arc<IdentityKeyPair>, config: ConnectionConfig) -> Self {
        Self {
            identity,
            config,
            active: Mutex::new(None),
        }
    }

    /// This node's NodeID
    pub fn node_id(&self) -> NodeId {
        self.identity.id()
    }

    /// This node's identity keys
    pub fn identity(&self) -> &Arc<IdentityKeyPair> {
        &self.identity
    }

    /// Establish a tunnel to a peer and start routing frames to/from `nic`
    ///
    /// Fails if a tunnel is already active; disconnect first.
    pub async fn connect(
        &self,
        request: ConnectRequest,
        nic: Arc<dyn VirtualNic>,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(ProtocolError::Violation(
                "a tunnel is already active".to_string(),
            ));
        }

        info!(peer = %request.peer_id, "connecting");

        let conn = Connection::dial(
            self.identity.clone(),
            PeerConfig {
                peer_id: request.peer_id,
                peer_key: request.peer_key,
                mode: request.mode,
            },
            self.config.clone(),
        )
        .await?;

        let router = Router::spawn(nic, &conn)?;
        *active = Some(ActiveTunnel { conn, router });
        Ok(())
    }

    /// Adopt an accepted connection (listener role) and route it
    pub async fn attach(&self, conn: Arc<Connection>, nic: Arc<dyn VirtualNic>) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(ProtocolError::Violation(
                "a tunnel is already active".to_string(),
            ));
        }

        let router = Router::spawn(nic, &conn)?;
        *active = Some(ActiveTunnel { conn, router });
        Ok(())
    }

    /// Tear the active tunnel down
    pub async fn disconnect(&self) -> Result<()> {
        let tunnel = self.active.lock().await.take();
        match tunnel {
            Some(ActiveTunnel { conn, router }) => {
                info!("disconnecting");
                router.shutdown().await;
                conn.close().await;
                Ok(())
            }
            None => Err(ProtocolError::Closed),
        }
    }

    /// Snapshot of the active tunnel, or a disconnected placeholder
    pub async fn status(&self) -> StatusSnapshot {
        match self.active.lock().await.as_ref() {
            Some(tunnel) => tunnel.conn.status(),
            None => StatusSnapshot {
                state: ConnState::Disconnected,
                session_id: None,
                peer_id: None,
                transport: "none".to_string(),
                stats: Default::default(),
                rotation_deadline_secs: None,
                last_heartbeat_ack_ms: None,
                last_error: None,
            },
        }
    }
}
