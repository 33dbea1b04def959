//! Deterministic frame nonce construction
//!
//! A frame nonce is `salt(4) ‖ counter(8, big-endian)`. The 4-byte salt is a
//! fixed per-direction value from the session key schedule, so nonce
//! uniqueness under a given key reduces to the counter never repeating.

/// Deterministic 12-byte frame nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameNonce([u8; 12]);

impl FrameNonce {
    /// Build a nonce from a per-direction salt and a frame counter
    pub fn new(salt: [u8; 4], counter: u64) -> Self {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&salt);
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        Self(nonce)
    }

    /// Get the nonce bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Extract the counter component
    pub fn counter(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[4..]);
        u64::from_be_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_layout() {
        let nonce = FrameNonce::new([0xAA, 0xBB, 0xCC, 0xDD], 0x0102030405060708);
        assert_eq!(
            nonce.as_bytes(),
            &[0xAA, 0xBB, 0xCC, 0xDD, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_nonce_counter_roundtrip() {
        let nonce = FrameNonce::new([0; 4], 42);
        assert_eq!(nonce.counter(), 42);
    }

    #[test]
    fn test_nonce_unique_per_counter() {
        let salt = [9u8; 4];
        assert_ne!(FrameNonce::new(salt, 0), FrameNonce::new(salt, 1));
    }

    #[test]
    fn test_nonce_unique_per_direction() {
        assert_ne!(
            FrameNonce::new([0u8; 4], 7),
            FrameNonce::new([1u8; 4], 7)
        );
    }
}
