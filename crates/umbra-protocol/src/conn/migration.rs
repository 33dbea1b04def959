//! Relay→direct transport migration
//!
//! After a relay-brokered session is established, both sides may hold a
//! migration secret and the initiator knows the responder's direct endpoint
//! and pinned certificate from ESTABLISHED. The initiator dials the
//! endpoint over pinned TLS and proves session ownership with a MAC under
//! the migration secret; the responder verifies and confirms. Fresh
//! directional keys are derived for the new transport, the outbound path
//! switches atomically, and the relay stays up only long enough to drain
//! in-flight frames.
//!
//! A failed attempt retries after a cool-down. If both peers sit behind
//! symmetric NAT the attempt is abandoned permanently and relay remains the
//! transport.

use crate::capability::{Capabilities, SYMMETRIC_NAT};
use crate::conn::driver::Event;
use crate::conn::ConnectionConfig;
use crate::handshake::keys::MigrationSecret;
use crate::handshake::machine::Role;
use crate::session::SessionMeta;
use crate::wire::messages::{Established, Message, Response, SessionId};
use crate::wire::{codec, Decoded, Phase};
use crate::{ProtocolError, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use umbra_crypto::mem::ct_eq;
use umbra_net::transport::tls::DirectListener;
use umbra_net::transport::{MessageTransport, WsSink, WsSource, WsTransport};

/// Delay between session establishment and the first migration attempt,
/// long enough for both sides to arm their direct path
pub(crate) const INITIAL_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// A proven direct transport, ready to install
pub(crate) struct MigrationOutcome {
    /// Write half of the direct transport
    pub sink: WsSink,
    /// Read half of the direct transport
    pub source: WsSource,
}

/// Where the migration stands for the current epoch
pub(crate) enum MigrationState {
    /// Not applicable (direct dial, disabled, or no secret)
    Off,
    /// Abandoned permanently (both peers behind symmetric NAT)
    Abandoned,
    /// Waiting for the next attempt
    Pending,
    /// An attempt is running (initiator) or the accept loop is armed
    /// (responder)
    InFlight,
    /// Direct transport installed
    Migrated,
}

impl MigrationState {
    /// Decide whether migration applies to this epoch
    pub(crate) fn plan(
        config: &ConnectionConfig,
        meta: &SessionMeta,
        role: Role,
        via_relay: bool,
        has_secret: bool,
    ) -> Self {
        if !config.migration.enabled || !via_relay || !has_secret {
            return Self::Off;
        }

        let local = Capabilities(config.handshake.capabilities);
        if local.contains(SYMMETRIC_NAT) && meta.peer_capabilities.contains(SYMMETRIC_NAT) {
            debug!("both peers behind symmetric NAT, abandoning direct migration");
            return Self::Abandoned;
        }

        let has_path = match role {
            Role::Initiator => meta.peer_direct.is_some(),
            Role::Responder => config.direct_listener.is_some(),
        };

        if has_path {
            Self::Pending
        } else {
            Self::Off
        }
    }

    /// Whether the driver should launch an attempt when the timer fires
    pub(crate) fn should_attempt(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// An attempt was launched
    pub(crate) fn mark_in_flight(&mut self) {
        *self = Self::InFlight;
    }

    /// The attempt failed; schedule a retry after the cool-down
    pub(crate) fn mark_failed(&mut self, _config: &ConnectionConfig) {
        if !matches!(self, Self::Abandoned | Self::Migrated) {
            *self = Self::Pending;
        }
    }

    /// The direct transport is live
    pub(crate) fn mark_migrated(&mut self) {
        *self = Self::Migrated;
    }

    /// Whether the direct transport has been installed
    pub(crate) fn is_migrated(&self) -> bool {
        matches!(self, Self::Migrated)
    }

    /// When the next attempt may run, if one is pending
    pub(crate) fn next_attempt(&self, config: &ConnectionConfig) -> Option<tokio::time::Instant> {
        self.should_attempt()
            .then(|| tokio::time::Instant::now() + config.migration.cooldown)
    }
}

/// Launch the role-appropriate migration task
pub(crate) fn spawn_attempt(
    config: &ConnectionConfig,
    meta: &SessionMeta,
    role: Role,
    secret: &Option<MigrationSecret>,
    capabilities: u32,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let secret = match secret {
        Some(secret) => secret.clone(),
        None => return,
    };
    let session_id = meta.session_id;
    let attempt_timeout = config.migration.attempt_timeout;

    match role {
        Role::Initiator => {
            let peer_direct = match meta.peer_direct {
                Some(info) => info,
                None => return,
            };

            tokio::spawn(async move {
                let attempt = initiator_attempt(
                    peer_direct.endpoint,
                    peer_direct.cert_fingerprint,
                    session_id,
                    &secret,
                    capabilities,
                    attempt_timeout,
                );

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = attempt => match result {
                        Ok(outcome) => {
                            let _ = events.send(Event::MigrationReady(Box::new(outcome))).await;
                        }
                        Err(e) => {
                            let _ = events.send(Event::MigrationFailed(e.to_string())).await;
                        }
                    }
                }
            });
        }
        Role::Responder => {
            let listener = match &config.direct_listener {
                Some(listener) => listener.clone(),
                None => return,
            };
            let template = EstablishedTemplate::from_meta(meta, capabilities);

            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = responder_accept_loop(
                        listener, session_id, &secret, template, attempt_timeout,
                    ) => match result {
                        Ok(outcome) => {
                            let _ = events.send(Event::MigrationReady(Box::new(outcome))).await;
                        }
                        Err(e) => {
                            let _ = events.send(Event::MigrationFailed(e.to_string())).await;
                        }
                    }
                }
            });
        }
    }
}

/// Dial the peer's direct endpoint and prove session ownership
async fn initiator_attempt(
    endpoint: std::net::SocketAddr,
    fingerprint: [u8; 32],
    session_id: SessionId,
    secret: &MigrationSecret,
    capabilities: u32,
    timeout: std::time::Duration,
) -> Result<MigrationOutcome> {
    let attempt = async {
        let mut transport =
            umbra_net::transport::tls::dial_direct(endpoint, fingerprint, timeout).await?;

        let response = Message::Response(Response {
            session_id,
            proof: secret.proof(&session_id),
            capabilities,
        });
        transport.send(codec::encode(&response, 0, 0)).await?;

        // Await the confirmation on the new transport
        loop {
            let bytes = transport
                .recv()
                .await?
                .ok_or(ProtocolError::Network(umbra_net::NetworkError::Closed))?;

            match codec::decode(&bytes, Phase::Handshake)? {
                Decoded::Message {
                    message: Message::Established(est),
                    ..
                } => {
                    if est.session_id != session_id {
                        return Err(ProtocolError::Violation(
                            "migration confirmation names a different session".to_string(),
                        ));
                    }
                    let (sink, source) = transport.split();
                    return Ok(MigrationOutcome { sink, source });
                }
                Decoded::Message { message, .. } => {
                    return Err(ProtocolError::Violation(format!(
                        "unexpected {:?} during migration",
                        message
                    )));
                }
                Decoded::IgnoredExtension { .. } => continue,
            }
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(inner) => inner,
        Err(_) => Err(ProtocolError::Network(umbra_net::NetworkError::Timeout)),
    }
}

/// Session parameters echoed in the migration confirmation
struct EstablishedTemplate {
    mtu: u16,
    heartbeat_secs: u16,
    rotation_secs: u32,
    capabilities: u32,
}

impl EstablishedTemplate {
    fn from_meta(meta: &SessionMeta, capabilities: u32) -> Self {
        Self {
            mtu: meta.mtu,
            heartbeat_secs: meta.heartbeat_interval.as_secs() as u16,
            rotation_secs: meta.rotation_interval.as_secs() as u32,
            capabilities,
        }
    }

    fn message(&self, session_id: SessionId) -> Message {
        Message::Established(Box::new(Established {
            session_id,
            mtu: self.mtu,
            heartbeat_secs: self.heartbeat_secs,
            rotation_secs: self.rotation_secs,
            capabilities: self.capabilities,
            direct_endpoint: None,
            direct_cert: None,
        }))
    }
}

/// Accept direct-path connections until one proves it owns our session
async fn responder_accept_loop(
    listener: Arc<DirectListener>,
    session_id: SessionId,
    secret: &MigrationSecret,
    template: EstablishedTemplate,
    per_conn_timeout: std::time::Duration,
) -> Result<MigrationOutcome> {
    loop {
        let mut transport = listener.accept().await?;

        match verify_migration_request(&mut transport, session_id, secret, per_conn_timeout).await
        {
            Ok(()) => {
                transport
                    .send(codec::encode(&template.message(session_id), 0, 0))
                    .await?;
                let (sink, source) = transport.split();
                return Ok(MigrationOutcome { sink, source });
            }
            Err(e) => {
                warn!("rejected direct-path connection: {}", e);
                transport.close().await;
            }
        }
    }
}

/// Read and verify the migration RESPONSE on a fresh direct connection
async fn verify_migration_request(
    transport: &mut WsTransport,
    session_id: SessionId,
    secret: &MigrationSecret,
    timeout: std::time::Duration,
) -> Result<()> {
    let request = tokio::time::timeout(timeout, async {
        loop {
            let bytes = transport
                .recv()
                .await?
                .ok_or(ProtocolError::Network(umbra_net::NetworkError::Closed))?;

            match codec::decode(&bytes, Phase::Handshake)? {
                Decoded::Message {
                    message: Message::Response(response),
                    ..
                } => return Ok(response),
                Decoded::Message { message, .. } => {
                    return Err(ProtocolError::Violation(format!(
                        "unexpected {:?} on direct path",
                        message
                    )));
                }
                Decoded::IgnoredExtension { .. } => continue,
            }
        }
    })
    .await
    .map_err(|_| ProtocolError::Network(umbra_net::NetworkError::Timeout))??;

    if request.session_id != session_id {
        return Err(ProtocolError::Violation(
            "migration request names a different session".to_string(),
        ));
    }

    let expected = secret.proof(&session_id);
    if !ct_eq(&expected, &request.proof) {
        return Err(ProtocolError::Crypto(
            "migration proof mismatch".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DIRECT_P2P;
    use crate::handshake::machine::PeerDirectInfo;
    use std::time::{Duration, Instant};
    use umbra_crypto::NodeId;

    fn meta(peer_caps: u32, peer_direct: Option<PeerDirectInfo>) -> SessionMeta {
        SessionMeta {
            session_id: SessionId([1u8; 16]),
            peer_id: NodeId([2u8; 32]),
            peer_capabilities: Capabilities(peer_caps),
            mtu: 1380,
            heartbeat_interval: Duration::from_secs(15),
            rotation_interval: Duration::from_secs(3600),
            rotation_deadline: Instant::now() + Duration::from_secs(3600),
            established_at: Instant::now(),
            peer_direct,
            role: Role::Initiator,
        }
    }

    fn direct_info() -> PeerDirectInfo {
        PeerDirectInfo {
            endpoint: "127.0.0.1:5000".parse().unwrap(),
            cert_fingerprint: [7u8; 32],
        }
    }

    #[test]
    fn test_plan_requires_relay_and_secret() {
        let config = ConnectionConfig::default();
        let meta = meta(DIRECT_P2P, Some(direct_info()));

        assert!(matches!(
            MigrationState::plan(&config, &meta, Role::Initiator, true, true),
            MigrationState::Pending
        ));
        assert!(matches!(
            MigrationState::plan(&config, &meta, Role::Initiator, false, true),
            MigrationState::Off
        ));
        assert!(matches!(
            MigrationState::plan(&config, &meta, Role::Initiator, true, false),
            MigrationState::Off
        ));
    }

    #[test]
    fn test_plan_abandons_on_double_symmetric_nat() {
        let mut config = ConnectionConfig::default();
        config.handshake.capabilities |= SYMMETRIC_NAT;
        let meta = meta(DIRECT_P2P | SYMMETRIC_NAT, Some(direct_info()));

        assert!(matches!(
            MigrationState::plan(&config, &meta, Role::Initiator, true, true),
            MigrationState::Abandoned
        ));
    }

    #[test]
    fn test_plan_initiator_needs_peer_endpoint() {
        let config = ConnectionConfig::default();
        let meta = meta(DIRECT_P2P, None);

        assert!(matches!(
            MigrationState::plan(&config, &meta, Role::Initiator, true, true),
            MigrationState::Off
        ));
    }

    #[test]
    fn test_state_transitions() {
        let config = ConnectionConfig::default();
        let mut state = MigrationState::Pending;

        assert!(state.should_attempt());
        state.mark_in_flight();
        assert!(!state.should_attempt());

        state.mark_failed(&config);
        assert!(state.should_attempt());
        assert!(state.next_attempt(&config).is_some());

        state.mark_migrated();
        assert!(!state.should_attempt());
        state.mark_failed(&config);
        assert!(!state.should_attempt());
    }
}
