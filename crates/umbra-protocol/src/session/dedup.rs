//! Frame deduplication across a transport switchover
//!
//! During relay→direct migration both transports are briefly live. Frames
//! are never dual-sent, so this window is a guard against retransmission at
//! the switch boundary: while active, it records a digest of every
//! delivered plaintext frame and drops an identical frame arriving on the
//! other path. Outside a migration it costs one boolean check per frame.

use std::collections::VecDeque;
use umbra_crypto::hash::domain::DOMAIN_FRAME_DEDUP;

/// How many recent frame digests the window holds while active
pub const DEDUP_CAPACITY: usize = 256;

/// Short-lived duplicate filter for the migration switchover
#[derive(Debug, Default)]
pub struct DedupWindow {
    digests: VecDeque<[u8; 32]>,
    active: bool,
}

impl DedupWindow {
    /// Create an inactive window
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording (called when the switchover begins)
    pub fn activate(&mut self) {
        self.active = true;
        self.digests.clear();
    }

    /// Stop recording and drop state (called after the grace period)
    pub fn deactivate(&mut self) {
        self.active = false;
        self.digests.clear();
    }

    /// Whether the window is currently filtering
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record a delivered frame; returns `true` if it was already seen
    /// (the caller must then drop it instead of delivering twice)
    pub fn check_and_record(&mut self, frame: &[u8]) -> bool {
        if !self.active {
            return false;
        }

        let digest = blake3::derive_key(DOMAIN_FRAME_DEDUP, frame);
        if self.digests.contains(&digest) {
            return true;
        }

        if self.digests.len() == DEDUP_CAPACITY {
            self.digests.pop_front();
        }
        self.digests.push_back(digest);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_records_nothing() {
        let mut window = DedupWindow::new();
        assert!(!window.check_and_record(b"frame"));
        assert!(!window.check_and_record(b"frame"));
    }

    #[test]
    fn test_active_drops_duplicates() {
        let mut window = DedupWindow::new();
        window.activate();

        assert!(!window.check_and_record(b"frame-1"));
        assert!(!window.check_and_record(b"frame-2"));
        assert!(window.check_and_record(b"frame-1"));
    }

    #[test]
    fn test_deactivate_clears_state() {
        let mut window = DedupWindow::new();
        window.activate();
        assert!(!window.check_and_record(b"frame"));

        window.deactivate();
        window.activate();
        assert!(!window.check_and_record(b"frame"));
    }

    #[test]
    fn test_capacity_bounded() {
        let mut window = DedupWindow::new();
        window.activate();

        for i in 0..(DEDUP_CAPACITY + 10) {
            let frame = format!("frame-{}", i);
            assert!(!window.check_and_record(frame.as_bytes()));
        }

        // The oldest entries have been evicted
        assert!(!window.check_and_record(b"frame-0"));
    }
}
