//! Per-session state and the frame encryption pipeline
//!
//! A [`Session`] is created atomically at handshake completion and split
//! into single-writer halves matching the task that owns them: the write
//! loop owns [`TxSession`] (key, salt, monotonic counter), the read loop
//! owns [`RxSession`] (key, salt, replay window). Metadata is read-mostly
//! and shared; statistics are atomics shared with the status surface.

pub mod dedup;
pub mod replay;

use crate::handshake::keys::MigrationSecret;
use crate::handshake::machine::{PeerDirectInfo, PendingSession, Role};
use crate::wire::messages::DataFrame;
use crate::wire::SessionId;
use crate::{ProtocolError, Result};
use replay::ReplayWindow;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use umbra_crypto::symmetric::{self, FrameNonce};
use umbra_crypto::NodeId;
use zeroize::Zeroizing;

/// The TX counter value that forces rotation: sealing is refused once the
/// next counter would be `2^63 − 1`
pub const MAX_TX_COUNTER: u64 = (1 << 63) - 1;

/// Soft threshold at which the pipeline asks for rotation ahead of the cap
pub const ROTATION_COUNTER_THRESHOLD: u64 = MAX_TX_COUNTER - 1024;

/// Shared per-session counters, updated lock-free by the pipeline tasks
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Data frames sealed and handed to the transport
    pub frames_sent: AtomicU64,
    /// Data frames decrypted and delivered
    pub frames_received: AtomicU64,
    /// Plaintext bytes sent
    pub bytes_sent: AtomicU64,
    /// Plaintext bytes received
    pub bytes_received: AtomicU64,
    /// Seal failures (MTU violations, counter exhaustion, AEAD errors)
    pub encrypt_errors: AtomicU64,
    /// Open failures (authentication failures)
    pub decrypt_errors: AtomicU64,
    /// Frames dropped by the replay window
    pub replay_drops: AtomicU64,
    /// Frames rejected because the send queue was full
    pub send_queue_drops: AtomicU64,
    /// Frames dropped because the receive queue was full
    pub recv_queue_drops: AtomicU64,
    /// Unix milliseconds of the last sealed frame
    pub last_tx_unix_ms: AtomicU64,
    /// Unix milliseconds of the last delivered frame
    pub last_rx_unix_ms: AtomicU64,
}

impl SessionStats {
    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            encrypt_errors: self.encrypt_errors.load(Ordering::Relaxed),
            decrypt_errors: self.decrypt_errors.load(Ordering::Relaxed),
            replay_drops: self.replay_drops.load(Ordering::Relaxed),
            send_queue_drops: self.send_queue_drops.load(Ordering::Relaxed),
            recv_queue_drops: self.recv_queue_drops.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Data frames sealed and handed to the transport
    pub frames_sent: u64,
    /// Data frames decrypted and delivered
    pub frames_received: u64,
    /// Plaintext bytes sent
    pub bytes_sent: u64,
    /// Plaintext bytes received
    pub bytes_received: u64,
    /// Seal failures
    pub encrypt_errors: u64,
    /// Open failures
    pub decrypt_errors: u64,
    /// Replay-window drops
    pub replay_drops: u64,
    /// Send-queue overflow drops
    pub send_queue_drops: u64,
    /// Receive-queue overflow drops
    pub recv_queue_drops: u64,
}

/// Read-mostly session metadata
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Session identifier
    pub session_id: SessionId,
    /// Authenticated peer
    pub peer_id: NodeId,
    /// Peer capability bitmask
    pub peer_capabilities: crate::capability::Capabilities,
    /// Negotiated MTU
    pub mtu: u16,
    /// Negotiated heartbeat interval
    pub heartbeat_interval: Duration,
    /// Negotiated rotation interval
    pub rotation_interval: Duration,
    /// Absolute time at which a re-handshake must run
    pub rotation_deadline: Instant,
    /// When the session was created
    pub established_at: Instant,
    /// Peer direct-path parameters, when advertised
    pub peer_direct: Option<PeerDirectInfo>,
    /// Which role this side played in the handshake
    pub role: Role,
}

/// Sending half: key, salt, and the monotonic frame counter
pub struct TxSession {
    session_id: SessionId,
    key: Zeroizing<[u8; 32]>,
    salt: [u8; 4],
    counter: u64,
    mtu: usize,
    stats: Arc<SessionStats>,
}

impl TxSession {
    /// Seal one plaintext frame into a DATA message body
    ///
    /// Returns the frame and the header sequence (the counter used).
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(DataFrame, u64)> {
        if plaintext.len() > self.mtu {
            self.stats.encrypt_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ProtocolError::FrameTooLarge {
                size: plaintext.len(),
                mtu: self.mtu,
            });
        }

        if self.counter >= MAX_TX_COUNTER {
            self.stats.encrypt_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ProtocolError::RotationRequired);
        }

        let counter = self.counter;
        let nonce = FrameNonce::new(self.salt, counter);
        let aad = frame_aad(&self.session_id, counter);

        let ciphertext = symmetric::seal(&self.key, nonce.as_bytes(), plaintext, &aad)
            .map_err(|e| {
                self.stats.encrypt_errors.fetch_add(1, Ordering::Relaxed);
                ProtocolError::from(e)
            })?;

        self.counter += 1;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        self.stats
            .last_tx_unix_ms
            .store(unix_ms(), Ordering::Relaxed);

        Ok((
            DataFrame {
                session_id: self.session_id,
                nonce: *nonce.as_bytes(),
                ciphertext,
            },
            counter,
        ))
    }

    /// Whether the counter is close enough to the cap to rotate early
    pub fn needs_rotation(&self) -> bool {
        self.counter >= ROTATION_COUNTER_THRESHOLD
    }

    /// Current counter value (the next frame's sequence)
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Session this half belongs to
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[cfg(test)]
    pub(crate) fn set_counter_for_test(&mut self, counter: u64) {
        self.counter = counter;
    }
}

/// Receiving half: key, salt, and the replay window
pub struct RxSession {
    session_id: SessionId,
    key: Zeroizing<[u8; 32]>,
    salt: [u8; 4],
    window: ReplayWindow,
    stats: Arc<SessionStats>,
}

impl RxSession {
    /// Replay-check, decrypt, and commit one received DATA frame
    ///
    /// `sequence` is the header sequence field; it must match the counter
    /// embedded in the frame nonce. The replay window only advances after
    /// the frame authenticates.
    pub fn open(&mut self, frame: &DataFrame, sequence: u64) -> Result<Vec<u8>> {
        if frame.session_id != self.session_id {
            return Err(ProtocolError::Violation(format!(
                "frame for session {} on session {}",
                frame.session_id, self.session_id
            )));
        }

        let nonce = FrameNonce::new(self.salt, sequence);
        if nonce.as_bytes() != &frame.nonce {
            // Header sequence and nonce counter disagree, or wrong salt
            self.stats.decrypt_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ProtocolError::Crypto(
                "frame nonce does not match sequence".to_string(),
            ));
        }

        if let Err(e) = self.window.precheck(sequence) {
            self.stats.replay_drops.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let aad = frame_aad(&self.session_id, sequence);
        let plaintext = symmetric::open(&self.key, nonce.as_bytes(), &frame.ciphertext, &aad)
            .map_err(|e| {
                self.stats.decrypt_errors.fetch_add(1, Ordering::Relaxed);
                ProtocolError::from(e)
            })?;

        self.window.commit(sequence);
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        self.stats
            .last_rx_unix_ms
            .store(unix_ms(), Ordering::Relaxed);

        Ok(plaintext)
    }

    /// Session this half belongs to
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

/// The steady-state session object created at handshake completion
pub struct Session {
    meta: SessionMeta,
    tx: TxSession,
    rx: RxSession,
    migration: Option<MigrationSecret>,
}

impl Session {
    /// Build a session from a completed handshake
    pub fn new(pending: PendingSession, stats: Arc<SessionStats>) -> Self {
        let now = Instant::now();
        let meta = SessionMeta {
            session_id: pending.session_id,
            peer_id: pending.peer_id,
            peer_capabilities: pending.peer_capabilities,
            mtu: pending.mtu,
            heartbeat_interval: pending.heartbeat_interval,
            rotation_interval: pending.rotation_interval,
            rotation_deadline: now + pending.rotation_interval,
            established_at: now,
            peer_direct: pending.peer_direct,
            role: pending.role,
        };

        let keys = pending.keys;
        let tx = TxSession {
            session_id: pending.session_id,
            key: keys.tx_key,
            salt: keys.tx_salt,
            counter: 0,
            mtu: pending.mtu as usize,
            stats: stats.clone(),
        };
        let rx = RxSession {
            session_id: pending.session_id,
            key: keys.rx_key,
            salt: keys.rx_salt,
            window: ReplayWindow::new(),
            stats,
        };

        Session {
            meta,
            tx,
            rx,
            migration: keys.migration,
        }
    }

    /// Session metadata
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    /// Split into the task-owned halves
    ///
    /// Key ownership transfers to the tasks; the metadata is cloned into the
    /// shared read-mostly slot by the caller.
    pub fn split(
        self,
    ) -> (
        TxSession,
        RxSession,
        SessionMeta,
        Option<MigrationSecret>,
    ) {
        (self.tx, self.rx, self.meta, self.migration)
    }
}

/// Build a TX/RX pair directly from derived keys
///
/// Used by the migration path, where fresh directional keys come from the
/// migration secret rather than a full handshake.
pub(crate) fn pair_from_keys(
    session_id: SessionId,
    keys: crate::handshake::keys::SessionKeys,
    mtu: usize,
    stats: Arc<SessionStats>,
) -> (TxSession, RxSession) {
    (
        TxSession {
            session_id,
            key: keys.tx_key,
            salt: keys.tx_salt,
            counter: 0,
            mtu,
            stats: stats.clone(),
        },
        RxSession {
            session_id,
            key: keys.rx_key,
            salt: keys.rx_salt,
            window: ReplayWindow::new(),
            stats,
        },
    )
}

/// AAD binds each frame to its session and counter
fn frame_aad(session_id: &SessionId, counter: u64) -> [u8; 24] {
    let mut aad = [0u8; 24];
    aad[..16].copy_from_slice(session_id.as_bytes());
    aad[16..].copy_from_slice(&counter.to_be_bytes());
    aad
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::keys::SessionKeys;

    /// Build a mirrored (A, B) session pair without running a handshake
    fn session_pair(mtu: u16) -> (Session, Session, Arc<SessionStats>, Arc<SessionStats>) {
        let session_id = SessionId([0xAB; 16]);
        let id_a = NodeId([1u8; 32]);
        let id_b = NodeId([2u8; 32]);

        let keys_a = SessionKeys {
            tx_key: Zeroizing::new([0x11; 32]),
            rx_key: Zeroizing::new([0x22; 32]),
            tx_salt: [1, 2, 3, 4],
            rx_salt: [5, 6, 7, 8],
            migration: None,
        };
        let keys_b = SessionKeys {
            tx_key: Zeroizing::new([0x22; 32]),
            rx_key: Zeroizing::new([0x11; 32]),
            tx_salt: [5, 6, 7, 8],
            rx_salt: [1, 2, 3, 4],
            migration: None,
        };

        let pending = |keys, peer_id, role| PendingSession {
            session_id,
            keys,
            peer_id,
            mtu,
            heartbeat_interval: Duration::from_secs(15),
            rotation_interval: Duration::from_secs(3600),
            peer_capabilities: crate::capability::Capabilities(0),
            peer_direct: None,
            role,
        };

        let stats_a = Arc::new(SessionStats::default());
        let stats_b = Arc::new(SessionStats::default());
        let a = Session::new(pending(keys_a, id_b, Role::Initiator), stats_a.clone());
        let b = Session::new(pending(keys_b, id_a, Role::Responder), stats_b.clone());
        (a, b, stats_a, stats_b)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (a, b, stats_a, stats_b) = session_pair(1380);
        let (mut tx_a, _, _, _) = a.split();
        let (_, mut rx_b, _, _) = b.split();

        let (frame, seq) = tx_a.seal(b"ping").unwrap();
        assert_eq!(seq, 0);

        let plaintext = rx_b.open(&frame, seq).unwrap();
        assert_eq!(plaintext, b"ping");

        assert_eq!(stats_a.snapshot().frames_sent, 1);
        assert_eq!(stats_b.snapshot().frames_received, 1);
        assert_eq!(stats_b.snapshot().decrypt_errors, 0);
    }

    #[test]
    fn test_counter_monotonic_nonces_unique() {
        let (a, _, _, _) = session_pair(1380);
        let (mut tx, _, _, _) = a.split();

        let mut nonces = std::collections::HashSet::new();
        for i in 0..50 {
            let (frame, seq) = tx.seal(b"x").unwrap();
            assert_eq!(seq, i);
            assert!(nonces.insert(frame.nonce), "nonce repeated");
        }
    }

    #[test]
    fn test_tampered_frame_dropped_window_not_advanced() {
        let (a, b, _, stats_b) = session_pair(1380);
        let (mut tx_a, _, _, _) = a.split();
        let (_, mut rx_b, _, _) = b.split();

        let (mut frame, seq) = tx_a.seal(b"hello").unwrap();
        frame.ciphertext[0] ^= 0x01;

        assert!(matches!(
            rx_b.open(&frame, seq),
            Err(ProtocolError::Crypto(_))
        ));
        assert_eq!(stats_b.snapshot().decrypt_errors, 1);

        // The untampered frame still decrypts: the window did not advance
        frame.ciphertext[0] ^= 0x01;
        assert_eq!(rx_b.open(&frame, seq).unwrap(), b"hello");
    }

    #[test]
    fn test_replayed_frame_dropped_once() {
        let (a, b, _, stats_b) = session_pair(1380);
        let (mut tx_a, _, _, _) = a.split();
        let (_, mut rx_b, _, _) = b.split();

        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(tx_a.seal(b"data").unwrap());
        }

        for (frame, seq) in &frames {
            rx_b.open(frame, *seq).unwrap();
        }

        // Duplicate of counter 1
        let (frame, seq) = &frames[1];
        assert!(matches!(
            rx_b.open(frame, *seq),
            Err(ProtocolError::Replay(1))
        ));
        assert_eq!(stats_b.snapshot().replay_drops, 1);
        assert_eq!(stats_b.snapshot().frames_received, 3);
    }

    #[test]
    fn test_mtu_boundary() {
        let (a, b, stats_a, _) = session_pair(64);
        let (mut tx, _, _, _) = a.split();
        let (_, mut rx, _, _) = b.split();

        // Exactly MTU: seals and opens
        let at_mtu = vec![0x5A; 64];
        let (frame, seq) = tx.seal(&at_mtu).unwrap();
        assert_eq!(rx.open(&frame, seq).unwrap(), at_mtu);

        // MTU + 1: rejected before AEAD
        let over = vec![0x5A; 65];
        assert!(matches!(
            tx.seal(&over),
            Err(ProtocolError::FrameTooLarge { size: 65, mtu: 64 })
        ));
        assert_eq!(stats_a.snapshot().encrypt_errors, 1);
    }

    #[test]
    fn test_counter_exhaustion_boundary() {
        let (a, _, _, _) = session_pair(1380);
        let (mut tx, _, _, _) = a.split();

        // Counter at 2^63 − 2: one more frame is allowed
        tx.set_counter_for_test(MAX_TX_COUNTER - 1);
        let (_, seq) = tx.seal(b"last").unwrap();
        assert_eq!(seq, MAX_TX_COUNTER - 1);

        // Counter now at 2^63 − 1: rotation is forced
        assert!(matches!(
            tx.seal(b"one too many"),
            Err(ProtocolError::RotationRequired)
        ));
        assert!(tx.needs_rotation());
    }

    #[test]
    fn test_wrong_session_id_rejected() {
        let (a, b, _, _) = session_pair(1380);
        let (mut tx_a, _, _, _) = a.split();
        let (_, mut rx_b, _, _) = b.split();

        let (mut frame, seq) = tx_a.seal(b"data").unwrap();
        frame.session_id = SessionId([0xFF; 16]);

        assert!(matches!(
            rx_b.open(&frame, seq),
            Err(ProtocolError::Violation(_))
        ));
    }
}
