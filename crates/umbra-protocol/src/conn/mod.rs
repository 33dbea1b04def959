//! Connection manager
//!
//! A [`Connection`] owns the transport and the session built on top of it.
//! Per connection, four tasks run under one cancellation root: a read loop,
//! a write loop, and the supervising driver with its heartbeat and rotation
//! timers. Frames cross task boundaries through bounded queues; a full send
//! queue surfaces immediately as [`ProtocolError::SendBufferFull`].

pub mod driver;
pub mod listener;
pub mod migration;

use crate::handshake::HandshakeConfig;
use crate::session::{SessionMeta, SessionStats, StatsSnapshot};
use crate::{ProtocolError, Result};
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use umbra_crypto::sig::HybridPublicKey;
use umbra_crypto::{IdentityKeyPair, NodeId};
use umbra_net::transport::relay::PairingToken;
use umbra_net::BackoffConfig;

pub use listener::MeshListener;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    /// No transport
    Disconnected,
    /// Dialing the transport
    Connecting,
    /// Transport up, handshake running
    Handshaking,
    /// Session live, frames flowing
    Established,
    /// Transient failure, retrying with backoff
    Reconnecting,
    /// Terminal
    Closed,
}

/// How to reach the peer
#[derive(Debug, Clone)]
pub enum ConnectMode {
    /// Dial the peer's endpoint directly
    Direct {
        /// Peer listening address
        endpoint: SocketAddr,
    },
    /// Meet the peer through a relay broker
    Relay {
        /// Broker base URL (`ws://host:port`)
        broker: String,
        /// Pairing token shared with the peer
        token: PairingToken,
    },
}

/// The peer this connection talks to
#[derive(Clone)]
pub struct PeerConfig {
    /// Expected peer NodeID
    pub peer_id: NodeId,
    /// Trusted peer identity key (from discovery or pinning)
    pub peer_key: HybridPublicKey,
    /// Transport path
    pub mode: ConnectMode,
}

/// Relay→direct migration policy
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Whether to attempt migration at all
    pub enabled: bool,
    /// Give up on one direct attempt after this long
    pub attempt_timeout: Duration,
    /// Wait this long after a failed attempt before retrying
    pub cooldown: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempt_timeout: Duration::from_secs(5),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Tunables for a connection
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Handshake parameters (deadline, MTU, intervals, capabilities)
    pub handshake: HandshakeConfig,
    /// Reconnect after this many heartbeats go unanswered
    pub missed_heartbeat_limit: u32,
    /// Capacity of the send and receive queues
    pub queue_capacity: usize,
    /// Reconnect backoff policy
    pub backoff: BackoffConfig,
    /// How long old RX keys stay valid after rotation
    /// (`None` = 2× heartbeat interval)
    pub rotation_grace: Option<Duration>,
    /// Relay→direct migration policy
    pub migration: MigrationConfig,
    /// Direct-path listener for accepting migrations (responder side)
    pub direct_listener: Option<Arc<umbra_net::transport::tls::DirectListener>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            missed_heartbeat_limit: 3,
            queue_capacity: 1000,
            backoff: BackoffConfig::default(),
            rotation_grace: None,
            migration: MigrationConfig::default(),
            direct_listener: None,
        }
    }
}

impl ConnectionConfig {
    /// Effective grace window for old RX keys after rotation
    pub fn rotation_grace(&self) -> Duration {
        self.rotation_grace
            .unwrap_or(self.handshake.heartbeat_interval * 2)
    }
}

/// State shared between the driver tasks and the connection handle
pub(crate) struct Shared {
    pub(crate) state_tx: watch::Sender<ConnState>,
    pub(crate) stats: Arc<SessionStats>,
    pub(crate) meta: RwLock<Option<SessionMeta>>,
    pub(crate) transport: Mutex<String>,
    pub(crate) last_error: Mutex<Option<String>>,
    pub(crate) last_heartbeat_ack_ms: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> (Arc<Self>, watch::Receiver<ConnState>) {
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        (
            Arc::new(Self {
                state_tx,
                stats: Arc::new(SessionStats::default()),
                meta: RwLock::new(None),
                transport: Mutex::new("none".to_string()),
                last_error: Mutex::new(None),
                last_heartbeat_ack_ms: AtomicU64::new(0),
            }),
            state_rx,
        )
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        let _ = self.state_tx.send(state);
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    pub(crate) fn record_error(&self, error: &ProtocolError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    pub(crate) fn set_transport(&self, descriptor: String) {
        if let Ok(mut t) = self.transport.lock() {
            *t = descriptor;
        }
    }

    pub(crate) fn set_meta(&self, meta: SessionMeta) {
        if let Ok(mut slot) = self.meta.write() {
            *slot = Some(meta);
        }
    }

    pub(crate) fn mark_heartbeat_ack(&self) {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_heartbeat_ack_ms.store(ms, Ordering::Relaxed);
    }
}

/// Point-in-time view of a connection for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Lifecycle state
    pub state: ConnState,
    /// Session identifier, once established
    pub session_id: Option<String>,
    /// Authenticated peer
    pub peer_id: Option<String>,
    /// Transport description (relay vs direct)
    pub transport: String,
    /// Frame and error counters
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    /// Seconds until the rotation deadline
    pub rotation_deadline_secs: Option<u64>,
    /// Unix milliseconds of the last heartbeat ack
    pub last_heartbeat_ack_ms: Option<u64>,
    /// Last fatal or transient error observed
    pub last_error: Option<String>,
}

/// Handle to a live connection
///
/// The handle is the single entry point for the router (frames in and out)
/// and the control surface (status, close). Dropping the handle does not
/// stop the connection; call [`Connection::close`].
pub struct Connection {
    pub(crate) outbound_tx: mpsc::Sender<Bytes>,
    pub(crate) inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) state_rx: watch::Receiver<ConnState>,
    pub(crate) cancel: CancellationToken,
    pub(crate) driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Dial a peer and wait until the first session is established
    ///
    /// Returns once the connection reaches `Established`, or with the first
    /// fatal error. Reconnects after later transient failures happen in the
    /// background.
    pub async fn dial(
        identity: Arc<IdentityKeyPair>,
        peer: PeerConfig,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>> {
        let conn = driver::spawn_dialer(identity, peer, config);
        conn.wait_established().await?;
        Ok(conn)
    }

    /// Meet a peer through a relay broker as the handshake responder
    ///
    /// Both relay peers dial the broker; the one that listens logically
    /// answers the handshake. Blocks until the peer arrives and the
    /// handshake completes.
    pub async fn accept_via_relay(
        identity: Arc<IdentityKeyPair>,
        verifier: Arc<dyn crate::handshake::PeerVerifier>,
        broker: &str,
        token: &PairingToken,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>> {
        let transport = umbra_net::transport::relay::connect(broker, token).await?;
        driver::accept_connection(identity, verifier, transport, config, true).await
    }

    /// Queue one plaintext frame for encryption and transmission
    ///
    /// Never blocks: a full queue returns [`ProtocolError::SendBufferFull`]
    /// and increments the drop counter.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared
                    .stats
                    .send_queue_drops
                    .fetch_add(1, Ordering::Relaxed);
                Err(ProtocolError::SendBufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::Closed),
        }
    }

    /// Take the inbound plaintext receiver (once; the router owns it)
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.lock().ok()?.take()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// Authenticated peer, once established
    pub fn peer_id(&self) -> Option<NodeId> {
        self.shared.meta.read().ok()?.as_ref().map(|m| m.peer_id)
    }

    /// Wait for `Established`, failing on `Closed`
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow() {
                ConnState::Established => return Ok(()),
                ConnState::Closed => {
                    let reason = self
                        .shared
                        .last_error
                        .lock()
                        .ok()
                        .and_then(|e| e.clone())
                        .unwrap_or_else(|| "connection closed".to_string());
                    return Err(ProtocolError::Violation(reason));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ProtocolError::Closed);
            }
        }
    }

    /// Close the connection: best-effort CLOSE message, then cancel all tasks
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.driver.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.set_state(ConnState::Closed);
    }

    /// Point-in-time status for the control surface
    pub fn status(&self) -> StatusSnapshot {
        let meta = self.shared.meta.read().ok().and_then(|m| m.clone());
        let last_ack = self.shared.last_heartbeat_ack_ms.load(Ordering::Relaxed);

        StatusSnapshot {
            state: self.shared.state(),
            session_id: meta.as_ref().map(|m| m.session_id.to_hex()),
            peer_id: meta.as_ref().map(|m| m.peer_id.to_hex()),
            transport: self
                .shared
                .transport
                .lock()
                .map(|t| t.clone())
                .unwrap_or_default(),
            stats: self.shared.stats.snapshot(),
            rotation_deadline_secs: meta.as_ref().map(|m| {
                m.rotation_deadline
                    .saturating_duration_since(Instant::now())
                    .as_secs()
            }),
            last_heartbeat_ack_ms: (last_ack > 0).then_some(last_ack),
            last_error: self
                .shared
                .last_error
                .lock()
                .ok()
                .and_then(|e| e.clone()),
        }
    }
}

/// Map an error onto the CLOSE code sent to the peer
pub(crate) fn close_code_for(error: &ProtocolError) -> u16 {
    use crate::wire::messages::close_code;

    match error {
        ProtocolError::Crypto(_) => close_code::CRYPTO_FAILURE,
        ProtocolError::Malformed(_)
        | ProtocolError::Violation(_)
        | ProtocolError::VersionUnsupported(_) => close_code::PROTOCOL_ERROR,
        ProtocolError::PolicyRejected(_) | ProtocolError::CapabilityMismatch(_) => {
            close_code::POLICY_VIOLATION
        }
        _ => close_code::INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_grace_default_is_twice_heartbeat() {
        let config = ConnectionConfig::default();
        assert_eq!(
            config.rotation_grace(),
            config.handshake.heartbeat_interval * 2
        );

        let explicit = ConnectionConfig {
            rotation_grace: Some(Duration::from_secs(7)),
            ..Default::default()
        };
        assert_eq!(explicit.rotation_grace(), Duration::from_secs(7));
    }

    #[test]
    fn test_close_code_mapping() {
        use crate::wire::messages::close_code;

        assert_eq!(
            close_code_for(&ProtocolError::Crypto("bad".into())),
            close_code::CRYPTO_FAILURE
        );
        assert_eq!(
            close_code_for(&ProtocolError::Malformed("bad".into())),
            close_code::PROTOCOL_ERROR
        );
        assert_eq!(
            close_code_for(&ProtocolError::PolicyRejected("no".into())),
            close_code::POLICY_VIOLATION
        );
        assert_eq!(
            close_code_for(&ProtocolError::SendBufferFull),
            close_code::INTERNAL_ERROR
        );
    }
}
