//! Per-connection task orchestration
//!
//! One driver task supervises each connection. It dials (or adopts an
//! accepted transport), runs the handshake with its deadline, then splits
//! the transport and session into a write loop and a read loop, keeping the
//! heartbeat and rotation timers for itself. Transient failures tear the
//! epoch down and re-dial with backoff; fatal failures send a CLOSE and
//! stop.
//!
//! Ownership follows the locking discipline: the write loop exclusively
//! owns the TX half (key and counter), the read loop the RX half (key and
//! replay window). They never share a lock; everything crosses by message.

use crate::conn::{
    close_code_for, migration, ConnState, ConnectMode, Connection, ConnectionConfig, PeerConfig,
    Shared,
};
use crate::handshake::keys::MigrationSecret;
use crate::handshake::{HandshakeMachine, KeyRegistry, PeerVerifier, PendingSession, Role};
use crate::session::dedup::DedupWindow;
use crate::session::{RxSession, Session, SessionMeta, TxSession};
use crate::wire::messages::{close_code, error_code, CloseMessage, ErrorMessage, Message};
use crate::wire::{codec, Decoded, Phase, FLAG_KEY_ROTATION};
use crate::{ProtocolError, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use umbra_crypto::sig::HybridPublicKey;
use umbra_crypto::{IdentityKeyPair, NodeId};
use umbra_net::transport::{MessageTransport, WsSink, WsSource, WsTransport};
use tracing::{debug, info, warn};

/// Commands consumed by the write loop
pub(crate) enum WriteCmd {
    /// Seal and send one plaintext frame
    Frame(Bytes),
    /// Send a control message verbatim
    Control(Message, u8),
    /// Switch to new TX keys immediately (key rotation)
    InstallTx(TxSession),
    /// Swap the transport and TX keys (migration); the old sink is retired
    /// but kept open until [`WriteCmd::CloseRetired`]
    SwitchTransport(Box<WsSink>, TxSession),
    /// Close the retired sink after the migration grace period
    CloseRetired,
    /// Send CLOSE and shut the write loop down
    Close(u16, String),
}

/// Events reported to the driver by the pump tasks
pub(crate) enum Event {
    /// A handshake-type message arrived while established (key rotation)
    Handshake(Message, u8),
    /// Peer acknowledged a heartbeat
    HeartbeatAck,
    /// Peer sent CLOSE
    PeerClosed(u16, String),
    /// Peer sent ERROR
    PeerError(u16, String),
    /// The write loop hit a fatal or transport error
    Failed(ProtocolError),
    /// A read loop terminated (`error: None` = clean end-of-stream).
    /// `direct` distinguishes the migrated path from the relay path, so a
    /// drained relay closing after migration is not mistaken for a failure.
    ReadEnded {
        /// Whether the terminating read loop served the direct transport
        direct: bool,
        /// The error that ended the loop, if any
        error: Option<ProtocolError>,
    },
    /// The TX counter is near its cap; rotate now
    RotationNeeded,
    /// First DATA frame decrypted on the direct transport
    FirstDirectData,
    /// A migration attempt produced a proven direct transport
    MigrationReady(Box<migration::MigrationOutcome>),
    /// A migration attempt failed; retry after cool-down
    MigrationFailed(String),
}

/// Commands consumed by the read loop
pub(crate) enum ReadCmd {
    /// Install new RX keys; the old keys stay valid until `grace_until`
    InstallRx(RxSession, Instant),
}

/// How an established epoch ended
enum EpochEnd {
    /// Local close requested
    Closed,
    /// Peer closed; no reconnect
    PeerClosed,
}

/// Spawn the driver for a dialed connection
pub(crate) fn spawn_dialer(
    identity: Arc<IdentityKeyPair>,
    peer: PeerConfig,
    config: ConnectionConfig,
) -> Arc<Connection> {
    let (shared, state_rx) = Shared::new();
    let cancel = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);

    let driver = Driver {
        identity,
        peer_id: peer.peer_id,
        peer_key: peer.peer_key.clone(),
        mode: Some(peer.mode),
        config,
        shared: shared.clone(),
        cancel: cancel.clone(),
        outbound_rx,
        inbound_tx,
    };

    let handle = tokio::spawn(driver.run_dialer());

    Arc::new(Connection {
        outbound_tx,
        inbound_rx: Mutex::new(Some(inbound_rx)),
        shared,
        state_rx,
        cancel,
        driver: Mutex::new(Some(handle)),
    })
}

/// Run the responder handshake on an accepted transport and spawn the driver
///
/// Accepted connections do not reconnect: the dialer owns retry.
pub(crate) async fn accept_connection(
    identity: Arc<IdentityKeyPair>,
    verifier: Arc<dyn PeerVerifier>,
    mut transport: WsTransport,
    config: ConnectionConfig,
    via_relay: bool,
) -> Result<Arc<Connection>> {
    let (shared, state_rx) = Shared::new();
    shared.set_transport(transport.descriptor());
    shared.set_state(ConnState::Handshaking);

    let pending = match handshake_responder(&mut transport, &identity, &verifier, &config).await {
        Ok(pending) => pending,
        Err(e) => {
            send_close_best_effort(&mut transport, &e).await;
            shared.record_error(&e);
            shared.set_state(ConnState::Closed);
            return Err(e);
        }
    };

    let peer_id = pending.peer_id;
    let peer_key = verifier
        .trusted_key(&peer_id)
        .ok_or_else(|| ProtocolError::PolicyRejected(format!("key vanished for {}", peer_id)))?;

    let cancel = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);

    let driver = Driver {
        identity,
        peer_id,
        peer_key,
        mode: None,
        config,
        shared: shared.clone(),
        cancel: cancel.clone(),
        outbound_rx,
        inbound_tx,
    };

    let handle = tokio::spawn(driver.run_accepted(transport, pending, via_relay));

    Ok(Arc::new(Connection {
        outbound_tx,
        inbound_rx: Mutex::new(Some(inbound_rx)),
        shared,
        state_rx,
        cancel,
        driver: Mutex::new(Some(handle)),
    }))
}

struct Driver {
    identity: Arc<IdentityKeyPair>,
    peer_id: NodeId,
    peer_key: HybridPublicKey,
    /// `Some` for dialers (who own reconnect); `None` for accepted sides
    mode: Option<ConnectMode>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    outbound_rx: mpsc::Receiver<Bytes>,
    inbound_tx: mpsc::Sender<Bytes>,
}

impl Driver {
    /// Dialer main loop: connect, handshake, pump; reconnect on transient
    /// failure with exponential backoff until the attempt cap
    async fn run_dialer(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.shared.set_state(ConnState::Connecting);

            let result = self.connect_once().await;
            match result {
                Ok(EpochEnd::Closed) | Ok(EpochEnd::PeerClosed) => break,
                Err(e) if e.is_transient() && attempt < self.config.backoff.max_attempts => {
                    attempt += 1;
                    let backoff = self.config.backoff.backoff_for_attempt(attempt - 1);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient connection failure, reconnecting: {}",
                        e
                    );
                    self.shared.record_error(&e);
                    self.shared.set_state(ConnState::Reconnecting);

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    warn!("connection failed: {}", e);
                    self.shared.record_error(&e);
                    break;
                }
            }
        }

        self.shared.set_state(ConnState::Closed);
    }

    /// One dial + handshake + epoch
    async fn connect_once(&mut self) -> Result<EpochEnd> {
        let mode = self
            .mode
            .clone()
            .ok_or_else(|| ProtocolError::Violation("dialer without mode".to_string()))?;

        let mut transport = match &mode {
            ConnectMode::Direct { endpoint } => WsTransport::dial_addr(*endpoint).await?,
            ConnectMode::Relay { broker, token } => {
                umbra_net::transport::relay::connect(broker, token).await?
            }
        };
        self.shared.set_transport(transport.descriptor());

        self.shared.set_state(ConnState::Handshaking);
        let pending = match handshake_initiator(
            &mut transport,
            &self.identity,
            self.peer_id,
            self.peer_key.clone(),
            &self.config,
            false,
        )
        .await
        {
            Ok(pending) => pending,
            Err(e) => {
                send_close_best_effort(&mut transport, &e).await;
                return Err(e);
            }
        };

        let via_relay = matches!(mode, ConnectMode::Relay { .. });
        self.run_epoch(transport, pending, via_relay).await
    }

    /// Accepted-side main loop: single epoch, no redial
    async fn run_accepted(
        mut self,
        transport: WsTransport,
        pending: PendingSession,
        via_relay: bool,
    ) {
        let result = self.run_epoch(transport, pending, via_relay).await;
        if let Err(e) = result {
            warn!("accepted connection ended: {}", e);
            self.shared.record_error(&e);
        }
        self.shared.set_state(ConnState::Closed);
    }

    /// Run one established session epoch until close or failure
    async fn run_epoch(
        &mut self,
        transport: WsTransport,
        pending: PendingSession,
        via_relay: bool,
    ) -> Result<EpochEnd> {
        let role = pending.role;
        let session = Session::new(pending, self.shared.stats.clone());
        let (tx_sess, rx_sess, meta, mut migration_secret) = session.split();

        self.shared.set_meta(meta.clone());
        self.shared.set_state(ConnState::Established);
        info!(
            session = %meta.session_id,
            peer = %meta.peer_id,
            ?role,
            "session established"
        );

        let epoch_cancel = self.cancel.child_token();
        let (write_tx, write_rx) = mpsc::channel::<WriteCmd>(64);
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(64);
        let (read_ctrl_tx, read_ctrl_rx) = mpsc::channel::<ReadCmd>(8);
        let dedup = Arc::new(Mutex::new(DedupWindow::new()));

        let (sink, source) = transport.split();

        let write_handle = tokio::spawn(write_task(
            sink,
            tx_sess,
            write_rx,
            event_tx.clone(),
            epoch_cancel.clone(),
        ));

        let relay_read_cancel = epoch_cancel.child_token();
        let mut read_handles = vec![tokio::spawn(read_task(ReadTask {
            source,
            rx: rx_sess,
            prev_rx: None,
            inbound_tx: self.inbound_tx.clone(),
            write_tx: write_tx.clone(),
            event_tx: event_tx.clone(),
            cancel: relay_read_cancel.clone(),
            shared: self.shared.clone(),
            dedup: dedup.clone(),
            read_ctrl_rx,
            is_direct: false,
        }))];
        let mut active_read_ctrl = read_ctrl_tx;

        // Heartbeats
        let mut hb_timer = tokio::time::interval(meta.heartbeat_interval);
        hb_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        hb_timer.reset();
        let mut pending_acks: u32 = 0;

        // Rotation: the handshake initiator drives the timer; either side
        // rotates under counter pressure
        let mut meta = meta;
        let rotation_sleep = tokio::time::sleep_until(rotation_wakeup(&meta));
        tokio::pin!(rotation_sleep);
        let mut rekey: Option<HandshakeMachine> = None;
        let mut rekey_started: Option<Instant> = None;

        // Migration
        let mut mig =
            migration::MigrationState::plan(&self.config, &meta, role, via_relay, migration_secret.is_some());
        let migration_sleep = tokio::time::sleep(migration::INITIAL_DELAY);
        tokio::pin!(migration_sleep);
        let mut relay_drain_deadline: Option<tokio::time::Instant> = None;

        let outcome: Result<EpochEnd> = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = write_tx
                        .send(WriteCmd::Close(close_code::NORMAL, "closing".to_string()))
                        .await;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    break Ok(EpochEnd::Closed);
                }

                maybe_frame = self.outbound_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => {
                            if write_tx.send(WriteCmd::Frame(frame)).await.is_err() {
                                break Err(ProtocolError::Closed);
                            }
                        }
                        None => break Ok(EpochEnd::Closed),
                    }
                }

                maybe_event = event_rx.recv() => {
                    let event = match maybe_event {
                        Some(event) => event,
                        None => break Err(ProtocolError::Closed),
                    };

                    match event {
                        Event::HeartbeatAck => {
                            pending_acks = 0;
                        }
                        Event::Handshake(message, flags) => {
                            if rekey.is_none() {
                                rekey_started = Some(Instant::now());
                            }
                            match self.on_rekey_message(
                                &mut rekey, message, flags, &mut meta,
                                &mut migration_secret, &write_tx, &active_read_ctrl,
                            ).await {
                                Ok(rotated) => {
                                    if rotated {
                                        rekey_started = None;
                                        rotation_sleep.as_mut().reset(rotation_wakeup(&meta));
                                    }
                                }
                                Err(e) => {
                                    self.fail_epoch(&write_tx, &e).await;
                                    break Err(e);
                                }
                            }
                        }
                        Event::RotationNeeded => {
                            if rekey.is_none() {
                                match self.start_rekey(&write_tx).await {
                                    Ok(machine) => {
                                        rekey = Some(machine);
                                        rekey_started = Some(Instant::now());
                                    }
                                    Err(e) => {
                                        self.fail_epoch(&write_tx, &e).await;
                                        break Err(e);
                                    }
                                }
                            }
                        }
                        Event::PeerClosed(code, reason) => {
                            info!(code, reason, "peer closed the connection");
                            break Ok(EpochEnd::PeerClosed);
                        }
                        Event::PeerError(code, message) => {
                            let e = ProtocolError::Violation(format!(
                                "peer error {}: {}", code, message
                            ));
                            break Err(e);
                        }
                        Event::ReadEnded { direct, error } => {
                            if !direct && mig.is_migrated() {
                                // The drained relay path closing is expected
                                // once the direct transport carries traffic
                                debug!("relay path ended after migration");
                                let _ = write_tx.send(WriteCmd::CloseRetired).await;
                                relay_read_cancel.cancel();
                                if let Ok(mut d) = dedup.lock() {
                                    d.deactivate();
                                }
                                relay_drain_deadline = None;
                            } else {
                                let e = error.unwrap_or(ProtocolError::Network(
                                    umbra_net::NetworkError::Closed,
                                ));
                                if !e.is_transient() {
                                    self.fail_epoch(&write_tx, &e).await;
                                }
                                break Err(e);
                            }
                        }
                        Event::Failed(e) => {
                            if !e.is_transient() {
                                self.fail_epoch(&write_tx, &e).await;
                            }
                            break Err(e);
                        }
                        Event::FirstDirectData => {
                            if relay_drain_deadline.is_none() {
                                relay_drain_deadline = Some(
                                    tokio::time::Instant::now() + self.config.rotation_grace(),
                                );
                            }
                        }
                        Event::MigrationReady(outcome) => {
                            match self.install_migration(
                                *outcome, &meta, &migration_secret, &write_tx,
                                &event_tx, &dedup, &epoch_cancel, &mut read_handles,
                            ) {
                                Ok(new_ctrl) => {
                                    active_read_ctrl = new_ctrl;
                                    mig.mark_migrated();
                                }
                                Err(e) => {
                                    warn!("migration install failed: {}", e);
                                    mig.mark_failed(&self.config);
                                    if let Some(at) = mig.next_attempt(&self.config) {
                                        migration_sleep.as_mut().reset(at);
                                    }
                                }
                            }
                        }
                        Event::MigrationFailed(reason) => {
                            debug!(reason, "direct migration attempt failed");
                            mig.mark_failed(&self.config);
                            if let Some(at) = mig.next_attempt(&self.config) {
                                migration_sleep.as_mut().reset(at);
                            }
                        }
                    }
                }

                _ = hb_timer.tick() => {
                    if pending_acks >= self.config.missed_heartbeat_limit {
                        warn!(missed = pending_acks, "heartbeats unanswered, reconnecting");
                        break Err(ProtocolError::Network(umbra_net::NetworkError::Timeout));
                    }
                    pending_acks += 1;
                    let _ = write_tx.send(WriteCmd::Control(Message::Heartbeat, 0)).await;

                    // A rotation handshake gets the same deadline as the
                    // initial one
                    if rekey.is_some() {
                        if let Some(started) = rekey_started {
                            if started.elapsed() > self.config.handshake.timeout {
                                break Err(ProtocolError::HandshakeTimeout);
                            }
                        }
                    }
                }

                _ = &mut rotation_sleep, if role == Role::Initiator => {
                    if rekey.is_none() {
                        match self.start_rekey(&write_tx).await {
                            Ok(machine) => rekey = Some(machine),
                            Err(e) => {
                                self.fail_epoch(&write_tx, &e).await;
                                break Err(e);
                            }
                        }
                    }
                    // Re-arm past the deadline; completion resets properly
                    rotation_sleep.as_mut().reset(
                        tokio::time::Instant::now() + meta.rotation_interval,
                    );
                }

                _ = &mut migration_sleep, if mig.should_attempt() => {
                    mig.mark_in_flight();
                    migration::spawn_attempt(
                        &self.config,
                        &meta,
                        role,
                        &migration_secret,
                        self.config.handshake.capabilities,
                        event_tx.clone(),
                        epoch_cancel.clone(),
                    );
                }

                _ = async {
                    match relay_drain_deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                }, if relay_drain_deadline.is_some() => {
                    debug!("closing drained relay transport after migration");
                    let _ = write_tx.send(WriteCmd::CloseRetired).await;
                    relay_read_cancel.cancel();
                    if let Ok(mut d) = dedup.lock() {
                        d.deactivate();
                    }
                    relay_drain_deadline = None;
                }
            }
        };

        epoch_cancel.cancel();
        let _ = write_handle.await;
        for handle in read_handles {
            let _ = handle.await;
        }

        outcome
    }

    /// Start a key-rotation handshake as initiator on the live connection
    async fn start_rekey(&self, write_tx: &mpsc::Sender<WriteCmd>) -> Result<HandshakeMachine> {
        info!("initiating key rotation");
        let (machine, hello, flags) = HandshakeMachine::initiate(
            self.identity.clone(),
            self.peer_id,
            self.peer_key.clone(),
            self.config.handshake.clone(),
            true,
        )?;
        write_tx
            .send(WriteCmd::Control(hello, flags))
            .await
            .map_err(|_| ProtocolError::Closed)?;
        Ok(machine)
    }

    /// Feed a handshake-type message received while established
    ///
    /// Returns `Ok(true)` when a rotation completed and new keys were
    /// installed.
    #[allow(clippy::too_many_arguments)]
    async fn on_rekey_message(
        &self,
        rekey: &mut Option<HandshakeMachine>,
        message: Message,
        flags: u8,
        meta: &mut SessionMeta,
        migration_secret: &mut Option<MigrationSecret>,
        write_tx: &mpsc::Sender<WriteCmd>,
        read_ctrl: &mpsc::Sender<ReadCmd>,
    ) -> Result<bool> {
        // A HELLO starts a peer-driven rotation
        if let Message::Hello(_) = &message {
            if flags & FLAG_KEY_ROTATION == 0 {
                return Err(ProtocolError::Violation(
                    "HELLO without rotation flag on established connection".to_string(),
                ));
            }
            if rekey.is_some() {
                // Simultaneous rotation: the lower NodeID wins as initiator
                if self.identity.id() < self.peer_id {
                    debug!("dropping peer rotation HELLO, local rotation in flight");
                    return Ok(false);
                }
                *rekey = None;
            }

            let registry = Arc::new(KeyRegistry::new());
            registry.insert(self.peer_id, self.peer_key.clone());
            *rekey = Some(HandshakeMachine::respond(
                self.identity.clone(),
                registry,
                self.config.handshake.clone(),
                true,
            ));
        }

        let machine = rekey.as_mut().ok_or_else(|| {
            ProtocolError::Violation(format!(
                "unexpected handshake message with no rotation in progress: {:?}",
                message
            ))
        })?;

        let output = machine.handle(message)?;

        if let Some(pending) = output.session {
            *rekey = None;
            info!(session = %pending.session_id, "key rotation complete");

            let session = Session::new(pending, self.shared.stats.clone());
            let (tx_sess, rx_sess, new_meta, new_migration) = session.split();

            // Ordering matters: new RX keys go in before the final reply so
            // the peer's first new-session frame always finds them; TX only
            // switches after the reply (the peer must see ESTABLISHED before
            // any frame under the new keys). Old RX keys survive the grace
            // window for in-flight frames.
            read_ctrl
                .send(ReadCmd::InstallRx(
                    rx_sess,
                    Instant::now() + self.config.rotation_grace(),
                ))
                .await
                .map_err(|_| ProtocolError::Closed)?;

            if let Some((reply, reply_flags)) = output.reply {
                write_tx
                    .send(WriteCmd::Control(reply, reply_flags))
                    .await
                    .map_err(|_| ProtocolError::Closed)?;
            }

            write_tx
                .send(WriteCmd::InstallTx(tx_sess))
                .await
                .map_err(|_| ProtocolError::Closed)?;

            *meta = new_meta.clone();
            if new_migration.is_some() {
                *migration_secret = new_migration;
            }
            self.shared.set_meta(new_meta);
            return Ok(true);
        }

        if let Some((reply, reply_flags)) = output.reply {
            write_tx
                .send(WriteCmd::Control(reply, reply_flags))
                .await
                .map_err(|_| ProtocolError::Closed)?;
        }

        Ok(false)
    }

    /// Install a proven direct transport: derive epoch keys, swap the write
    /// path atomically, and start a second read task for the direct source
    #[allow(clippy::too_many_arguments)]
    fn install_migration(
        &self,
        outcome: migration::MigrationOutcome,
        meta: &SessionMeta,
        migration_secret: &Option<MigrationSecret>,
        write_tx: &mpsc::Sender<WriteCmd>,
        event_tx: &mpsc::Sender<Event>,
        dedup: &Arc<Mutex<DedupWindow>>,
        epoch_cancel: &CancellationToken,
        read_handles: &mut Vec<tokio::task::JoinHandle<()>>,
    ) -> Result<mpsc::Sender<ReadCmd>> {
        let secret = migration_secret
            .as_ref()
            .ok_or_else(|| ProtocolError::Violation("no migration secret".to_string()))?;

        let keys = secret.direct_keys(&meta.session_id, &self.identity.id(), &meta.peer_id)?;
        let (tx_sess, rx_sess) = crate::session::pair_from_keys(
            meta.session_id,
            keys,
            meta.mtu as usize,
            self.shared.stats.clone(),
        );

        if let Ok(mut d) = dedup.lock() {
            d.activate();
        }

        let descriptor = outcome.sink.descriptor().to_string();
        write_tx
            .try_send(WriteCmd::SwitchTransport(Box::new(outcome.sink), tx_sess))
            .map_err(|_| ProtocolError::Closed)?;

        let (read_ctrl_tx, read_ctrl_rx) = mpsc::channel::<ReadCmd>(8);
        read_handles.push(tokio::spawn(read_task(ReadTask {
            source: outcome.source,
            rx: rx_sess,
            prev_rx: None,
            inbound_tx: self.inbound_tx.clone(),
            write_tx: write_tx.clone(),
            event_tx: event_tx.clone(),
            cancel: epoch_cancel.child_token(),
            shared: self.shared.clone(),
            dedup: dedup.clone(),
            read_ctrl_rx,
            is_direct: true,
        })));

        self.shared.set_transport(descriptor.clone());
        info!(transport = descriptor, "migrated to direct transport");

        Ok(read_ctrl_tx)
    }

    /// Best-effort CLOSE with the code matching the failure
    async fn fail_epoch(&self, write_tx: &mpsc::Sender<WriteCmd>, error: &ProtocolError) {
        let _ = write_tx
            .send(WriteCmd::Close(close_code_for(error), error.to_string()))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn rotation_wakeup(meta: &SessionMeta) -> tokio::time::Instant {
    tokio::time::Instant::from_std(meta.rotation_deadline)
}

/// The write loop: exclusive owner of the sink and the TX session
async fn write_task(
    sink: WsSink,
    tx: TxSession,
    mut cmd_rx: mpsc::Receiver<WriteCmd>,
    event_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let mut sink = sink;
    let mut tx = tx;
    let mut retired: Option<WsSink> = None;
    let mut rotation_signaled = false;

    loop {
        let cmd = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            WriteCmd::Frame(plaintext) => match tx.seal(&plaintext) {
                Ok((frame, sequence)) => {
                    let bytes = codec::encode(&Message::Data(frame), 0, sequence);
                    if let Err(e) = sink.send(bytes).await {
                        let _ = event_tx.send(Event::Failed(e.into())).await;
                        break;
                    }
                    if tx.needs_rotation() && !rotation_signaled {
                        rotation_signaled = true;
                        let _ = event_tx.send(Event::RotationNeeded).await;
                    }
                }
                Err(ProtocolError::RotationRequired) => {
                    // Frame refused at the counter cap: rotation must run
                    // before further frames are accepted
                    if !rotation_signaled {
                        rotation_signaled = true;
                        let _ = event_tx.send(Event::RotationNeeded).await;
                    }
                }
                Err(e) => {
                    debug!("frame seal failed: {}", e);
                }
            },
            WriteCmd::Control(message, flags) => {
                let bytes = codec::encode(&message, flags, 0);
                if let Err(e) = sink.send(bytes).await {
                    let _ = event_tx.send(Event::Failed(e.into())).await;
                    break;
                }
            }
            WriteCmd::InstallTx(new_tx) => {
                tx = new_tx;
                rotation_signaled = false;
            }
            WriteCmd::SwitchTransport(new_sink, new_tx) => {
                // Atomic outbound switch: every frame after this point goes
                // to the new transport; nothing is ever sent on both
                let old = std::mem::replace(&mut sink, *new_sink);
                retired = Some(old);
                tx = new_tx;
                rotation_signaled = false;
            }
            WriteCmd::CloseRetired => {
                if let Some(mut old) = retired.take() {
                    old.close().await;
                }
            }
            WriteCmd::Close(code, reason) => {
                let message = Message::Close(CloseMessage { code, reason });
                let _ = sink.send(codec::encode(&message, 0, 0)).await;
                sink.close().await;
                break;
            }
        }
    }

    if let Some(mut old) = retired.take() {
        old.close().await;
    }
    sink.close().await;
}

/// Frames parked while a rotation's new RX keys are still in flight
const PARK_CAPACITY: usize = 64;

/// Everything one read loop owns
struct ReadTask {
    source: WsSource,
    rx: RxSession,
    /// Old RX keys kept through the rotation grace window
    prev_rx: Option<(RxSession, Instant)>,
    inbound_tx: mpsc::Sender<Bytes>,
    write_tx: mpsc::Sender<WriteCmd>,
    event_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    dedup: Arc<Mutex<DedupWindow>>,
    read_ctrl_rx: mpsc::Receiver<ReadCmd>,
    is_direct: bool,
}

/// The read loop: exclusive owner of the source and the RX session(s)
async fn read_task(mut task: ReadTask) {
    let mut saw_direct_data = false;
    // Frames for a session we do not know yet: a rotation's first frames
    // can race the InstallRx command, so they wait here instead of dropping
    let mut parked: Vec<(crate::wire::messages::DataFrame, u64)> = Vec::new();

    loop {
        // Expire rotated-out keys past their grace window
        if let Some((_, until)) = &task.prev_rx {
            if Instant::now() >= *until {
                task.prev_rx = None;
            }
        }

        let bytes = tokio::select! {
            _ = task.cancel.cancelled() => break,

            cmd = task.read_ctrl_rx.recv() => {
                if let Some(ReadCmd::InstallRx(new_rx, grace_until)) = cmd {
                    let old = std::mem::replace(&mut task.rx, new_rx);
                    task.prev_rx = Some((old, grace_until));

                    // Frames that arrived ahead of the install decrypt now
                    for (frame, sequence) in parked.drain(..) {
                        if frame.session_id != task.rx.session_id() {
                            continue;
                        }
                        if let Ok(plaintext) = task.rx.open(&frame, sequence) {
                            deliver(&mut task, plaintext).await;
                        }
                    }
                }
                continue;
            }

            received = task.source.recv() => match received {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    let _ = task
                        .event_tx
                        .send(Event::ReadEnded {
                            direct: task.is_direct,
                            error: None,
                        })
                        .await;
                    break;
                }
                Err(e) => {
                    let _ = task
                        .event_tx
                        .send(Event::ReadEnded {
                            direct: task.is_direct,
                            error: Some(e.into()),
                        })
                        .await;
                    break;
                }
            },
        };

        let decoded = match codec::decode(&bytes, Phase::Established) {
            Ok(decoded) => decoded,
            Err(e) => {
                let _ = task
                    .event_tx
                    .send(Event::ReadEnded {
                        direct: task.is_direct,
                        error: Some(e),
                    })
                    .await;
                break;
            }
        };

        let (header, message) = match decoded {
            Decoded::Message { header, message } => (header, message),
            Decoded::IgnoredExtension { msg_type } => {
                debug!(msg_type, "ignoring unknown extension message");
                continue;
            }
        };

        match message {
            Message::Data(frame) => {
                // Dispatch to the session the frame names: current keys
                // first, then rotated-out keys within their grace window.
                // A frame for a session not installed yet is parked; it
                // raced the rotation install and decrypts in a moment.
                let plaintext = if frame.session_id == task.rx.session_id() {
                    task.rx.open(&frame, header.sequence)
                } else {
                    match task.prev_rx.as_mut() {
                        Some((prev, _)) if frame.session_id == prev.session_id() => {
                            prev.open(&frame, header.sequence)
                        }
                        _ => {
                            if parked.len() < PARK_CAPACITY {
                                parked.push((frame, header.sequence));
                            } else {
                                debug!("park buffer full, dropping frame for unknown session");
                            }
                            continue;
                        }
                    }
                };

                match plaintext {
                    Ok(plaintext) => {
                        if task.is_direct && !saw_direct_data {
                            saw_direct_data = true;
                            let _ = task.event_tx.send(Event::FirstDirectData).await;
                        }
                        deliver(&mut task, plaintext).await;
                    }
                    // Replay and authentication failures drop the frame and
                    // keep the session running; counters already incremented
                    Err(ProtocolError::Replay(counter)) => {
                        debug!(counter, "replay drop");
                    }
                    Err(e) => {
                        debug!("frame dropped: {}", e);
                    }
                }
            }
            Message::Heartbeat => {
                let _ = task
                    .write_tx
                    .send(WriteCmd::Control(Message::HeartbeatAck, 0))
                    .await;
            }
            Message::HeartbeatAck => {
                task.shared.mark_heartbeat_ack();
                let _ = task.event_tx.send(Event::HeartbeatAck).await;
            }
            Message::Hello(_)
            | Message::Challenge(_)
            | Message::Response(_)
            | Message::Established(_) => {
                let _ = task
                    .event_tx
                    .send(Event::Handshake(message, header.flags))
                    .await;
            }
            Message::Error(ErrorMessage { code, message }) => {
                let _ = task.event_tx.send(Event::PeerError(code, message)).await;
                break;
            }
            Message::Close(CloseMessage { code, reason }) => {
                let _ = task.event_tx.send(Event::PeerClosed(code, reason)).await;
                break;
            }
        }
    }
}

/// Hand one decrypted frame to the inbound queue
///
/// Applies the migration dedup filter and surfaces receive-queue overflow
/// as a counter rather than blocking the read loop.
async fn deliver(task: &mut ReadTask, plaintext: Vec<u8>) {
    let duplicate = task
        .dedup
        .lock()
        .map(|mut d| d.check_and_record(&plaintext))
        .unwrap_or(false);
    if duplicate {
        debug!("dropping duplicate frame across transport switch");
        return;
    }

    if task.inbound_tx.try_send(Bytes::from(plaintext)).is_err() {
        task.shared
            .stats
            .recv_queue_drops
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Drive the initiator handshake over an unsplit transport
pub(crate) async fn handshake_initiator(
    transport: &mut WsTransport,
    identity: &Arc<IdentityKeyPair>,
    peer_id: NodeId,
    peer_key: HybridPublicKey,
    config: &ConnectionConfig,
    rotation: bool,
) -> Result<PendingSession> {
    let (mut machine, hello, flags) = HandshakeMachine::initiate(
        identity.clone(),
        peer_id,
        peer_key,
        config.handshake.clone(),
        rotation,
    )?;

    transport.send(codec::encode(&hello, flags, 0)).await?;

    drive_handshake(transport, &mut machine, config.handshake.timeout).await
}

/// Drive the responder handshake over an unsplit transport
pub(crate) async fn handshake_responder(
    transport: &mut WsTransport,
    identity: &Arc<IdentityKeyPair>,
    verifier: &Arc<dyn PeerVerifier>,
    config: &ConnectionConfig,
) -> Result<PendingSession> {
    let mut machine = HandshakeMachine::respond(
        identity.clone(),
        verifier.clone(),
        config.handshake.clone(),
        false,
    );

    drive_handshake(transport, &mut machine, config.handshake.timeout).await
}

/// Shared message loop: feed decoded messages until a session or an error
async fn drive_handshake(
    transport: &mut WsTransport,
    machine: &mut HandshakeMachine,
    deadline: Duration,
) -> Result<PendingSession> {
    let result = tokio::time::timeout(deadline, async {
        loop {
            let bytes = transport
                .recv()
                .await?
                .ok_or(ProtocolError::Network(umbra_net::NetworkError::Closed))?;

            let (_, message) = match codec::decode(&bytes, Phase::Handshake)? {
                Decoded::Message { header, message } => (header, message),
                Decoded::IgnoredExtension { .. } => continue,
            };

            match message {
                Message::Error(e) => {
                    return Err(ProtocolError::Violation(format!(
                        "peer error {} during handshake: {}",
                        e.code, e.message
                    )));
                }
                Message::Close(c) => {
                    return Err(ProtocolError::Violation(format!(
                        "peer closed during handshake: {} {}",
                        c.code, c.reason
                    )));
                }
                message => {
                    let output = machine.handle(message)?;
                    if let Some((reply, flags)) = output.reply {
                        transport.send(codec::encode(&reply, flags, 0)).await?;
                    }
                    if let Some(session) = output.session {
                        return Ok(session);
                    }
                }
            }
        }
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(ProtocolError::HandshakeTimeout),
    }
}

/// Best-effort error + close when a handshake fails
pub(crate) async fn send_close_best_effort(transport: &mut WsTransport, error: &ProtocolError) {
    if let ProtocolError::VersionUnsupported(_) = error {
        let message = Message::Error(ErrorMessage {
            code: error_code::VERSION_UNSUPPORTED,
            message: "unsupported protocol version".to_string(),
        });
        let _ = transport.send(codec::encode(&message, 0, 0)).await;
    }

    let message = Message::Close(CloseMessage {
        code: close_code_for(error),
        reason: error.to_string(),
    });
    let _ = transport.send(codec::encode(&message, 0, 0)).await;
    transport.close().await;
}
