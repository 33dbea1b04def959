//! Pairing table
//!
//! One entry per token, at most two peers per entry. The broker buffers
//! messages a peer sends before its partner arrives (bounded) and flushes
//! them on pairing. Leaving drops the partner's channel, which the partner
//! observes as end-of-stream.

use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Pairing token presented by both peers
pub type PairToken = [u8; 32];

/// Per-peer forwarding channel capacity
const PEER_CHANNEL_CAPACITY: usize = 1024;

/// Errors surfaced to the WebSocket layer
#[derive(Error, Debug)]
pub enum PairError {
    /// The token already has two peers
    #[error("pairing already has two peers")]
    Full,
    /// The broker is at its pairing capacity
    #[error("broker at capacity")]
    Busy,
}

/// Index of a peer within its pairing (0 = first to arrive)
pub type PeerIndex = usize;

struct PairEntry {
    /// Forwarding channels, indexed by [`PeerIndex`]
    peers: [Option<mpsc::Sender<Bytes>>; 2],
    /// Messages from the first peer awaiting the second
    pending: Vec<Bytes>,
    last_activity: Instant,
}

/// All live pairings
pub struct PairManager {
    pairs: DashMap<PairToken, PairEntry>,
    max_pairs: usize,
    pending_buffer: usize,
}

impl PairManager {
    /// Create a pairing table
    pub fn new(max_pairs: usize, pending_buffer: usize) -> Self {
        Self {
            pairs: DashMap::new(),
            max_pairs,
            pending_buffer,
        }
    }

    /// Join a pairing; returns this peer's index and its receive channel
    ///
    /// The second peer to arrive also receives every message the first
    /// peer sent while waiting.
    pub fn join(&self, token: PairToken) -> Result<(PeerIndex, mpsc::Receiver<Bytes>), PairError> {
        // Capacity check outside the entry guard: len() walks every shard
        // and must not run while one shard is write-locked
        if !self.pairs.contains_key(&token) && self.pairs.len() >= self.max_pairs {
            return Err(PairError::Busy);
        }

        let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);

        match self.pairs.entry(token) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PairEntry {
                    peers: [Some(tx), None],
                    pending: Vec::new(),
                    last_activity: Instant::now(),
                });
                Ok((0, rx))
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.peers[1].is_some() {
                    return Err(PairError::Full);
                }

                // Second peer: flush everything the first peer sent while alone
                for buffered in entry.pending.drain(..) {
                    let _ = tx.try_send(buffered);
                }
                entry.peers[1] = Some(tx);
                entry.last_activity = Instant::now();

                Ok((1, rx))
            }
        }
    }

    /// Forward one message from `from` to its partner
    ///
    /// Messages sent before the partner arrives are buffered up to the
    /// configured limit; beyond it the oldest buffered message is dropped.
    pub fn forward(&self, token: &PairToken, from: PeerIndex, data: Bytes) {
        let mut entry = match self.pairs.get_mut(token) {
            Some(entry) => entry,
            None => return,
        };
        entry.last_activity = Instant::now();

        let partner = from ^ 1;
        match &entry.peers[partner] {
            Some(tx) => {
                // A full partner channel means the partner stopped draining;
                // dropping here keeps the broker memory-bounded
                if tx.try_send(data).is_err() {
                    debug!("partner channel full, dropping relayed message");
                }
            }
            None => {
                if entry.pending.len() >= self.pending_buffer {
                    entry.pending.remove(0);
                }
                entry.pending.push(data);
            }
        }
    }

    /// Remove a peer; the whole pairing goes with it
    ///
    /// Dropping the partner's sender ends the partner's receive stream,
    /// which the WebSocket layer turns into a close.
    pub fn leave(&self, token: &PairToken, _from: PeerIndex) {
        self.pairs.remove(token);
    }

    /// Drop pairings idle longer than `max_idle`
    pub fn sweep(&self, max_idle: Duration) {
        let now = Instant::now();
        self.pairs
            .retain(|_, entry| now.duration_since(entry.last_activity) < max_idle);
    }

    /// Number of live pairings
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_two_peers() {
        let manager = PairManager::new(16, 64);
        let token = [1u8; 32];

        let (idx_a, mut rx_a) = manager.join(token).unwrap();
        let (idx_b, mut rx_b) = manager.join(token).unwrap();
        assert_eq!(idx_a, 0);
        assert_eq!(idx_b, 1);

        manager.forward(&token, idx_a, Bytes::from_static(b"to-b"));
        manager.forward(&token, idx_b, Bytes::from_static(b"to-a"));

        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"to-b"));
        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"to-a"));
    }

    #[test]
    fn test_third_peer_rejected() {
        let manager = PairManager::new(16, 64);
        let token = [1u8; 32];

        let _a = manager.join(token).unwrap();
        let _b = manager.join(token).unwrap();
        assert!(matches!(manager.join(token), Err(PairError::Full)));
    }

    #[test]
    fn test_messages_buffered_until_partner_arrives() {
        let manager = PairManager::new(16, 64);
        let token = [2u8; 32];

        let (idx_a, _rx_a) = manager.join(token).unwrap();
        manager.forward(&token, idx_a, Bytes::from_static(b"early-1"));
        manager.forward(&token, idx_a, Bytes::from_static(b"early-2"));

        let (_, mut rx_b) = manager.join(token).unwrap();
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"early-1"));
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"early-2"));
    }

    #[test]
    fn test_capacity_enforced() {
        let manager = PairManager::new(1, 64);
        let _a = manager.join([1u8; 32]).unwrap();
        assert!(matches!(manager.join([2u8; 32]), Err(PairError::Busy)));
    }

    #[test]
    fn test_leave_removes_pairing() {
        let manager = PairManager::new(16, 64);
        let token = [3u8; 32];

        let (idx_a, _rx_a) = manager.join(token).unwrap();
        let (_, mut rx_b) = manager.join(token).unwrap();

        manager.leave(&token, idx_a);
        assert!(manager.is_empty());

        // Partner's stream ends
        assert!(matches!(
            rx_b.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_sweep_removes_idle() {
        let manager = PairManager::new(16, 64);
        let _a = manager.join([4u8; 32]).unwrap();
        assert_eq!(manager.len(), 1);

        manager.sweep(Duration::from_secs(0));
        assert!(manager.is_empty());
    }
}
