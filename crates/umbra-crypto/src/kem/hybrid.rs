//! Hybrid KEM combining ML-KEM-1024 and X25519
//!
//! The post-quantum and classical shared secrets are returned separately and
//! concatenated only inside the KDF step of the session key schedule, so the
//! derived keys stay secure as long as either component remains unbroken.
//!
//! The classical half uses the handshake's own ephemeral X25519 keypair on
//! both sides rather than an extra keypair generated at encapsulation time;
//! the responder's ephemeral public key travels in the CHALLENGE message.

use crate::error::Result;
use crate::kem::{mlkem, x25519};
use zeroize::{Zeroize, Zeroizing};

/// The two halves of a hybrid shared secret, kept separate until the KDF
pub struct HybridSecrets {
    /// Post-quantum shared secret from ML-KEM
    pub pq: mlkem::SharedSecret,
    /// Classical shared secret from X25519
    pub ecdh: x25519::SharedSecret,
}

impl HybridSecrets {
    /// Concatenate both secrets into KDF input key material (`pq ‖ ecdh`)
    ///
    /// The returned buffer is zeroized on drop.
    pub fn ikm(&self) -> Zeroizing<[u8; 64]> {
        let mut out = Zeroizing::new([0u8; 64]);
        out[..32].copy_from_slice(&self.pq.0);
        out[32..].copy_from_slice(&self.ecdh.0);
        out
    }

    /// Wipe both component secrets
    pub fn wipe(&mut self) {
        self.pq.0.zeroize();
        self.ecdh.0.zeroize();
    }
}

/// Ephemeral hybrid keypair generated per handshake attempt
pub struct EphemeralKeys {
    /// ML-KEM encapsulation public key
    pub kem_public: mlkem::PublicKey,
    /// ML-KEM decapsulation secret key
    pub kem_secret: mlkem::SecretKey,
    /// X25519 keypair
    pub ecdh: x25519::X25519KeyPair,
}

impl EphemeralKeys {
    /// Generate fresh ephemeral hybrid keys
    ///
    /// ML-KEM keygen can take tens of milliseconds; callers in async context
    /// should run this on a blocking thread.
    pub fn generate() -> Self {
        let (kem_public, kem_secret) = mlkem::MlKem::keygen();
        Self {
            kem_public,
            kem_secret,
            ecdh: x25519::X25519KeyPair::generate(),
        }
    }
}

/// Hybrid KEM operations
pub struct HybridKem;

impl HybridKem {
    /// Encapsulate to a peer's hybrid ephemeral public keys
    ///
    /// # Arguments
    ///
    /// * `peer_kem` - The peer's ML-KEM public key
    /// * `peer_ecdh` - The peer's ephemeral X25519 public key
    /// * `own_ecdh` - Our own ephemeral X25519 keypair
    ///
    /// # Returns
    ///
    /// The ML-KEM ciphertext to send to the peer, and both shared secrets.
    pub fn encapsulate(
        peer_kem: &mlkem::PublicKey,
        peer_ecdh: &x25519::X25519PublicKey,
        own_ecdh: &x25519::X25519KeyPair,
    ) -> Result<(mlkem::Ciphertext, HybridSecrets)> {
        let (ct, pq) = mlkem::MlKem::encapsulate(peer_kem)?;
        let ecdh = own_ecdh.diffie_hellman(peer_ecdh);

        Ok((ct, HybridSecrets { pq, ecdh }))
    }

    /// Decapsulate a hybrid ciphertext with our own ephemeral keys
    ///
    /// # Arguments
    ///
    /// * `ct` - The ML-KEM ciphertext received from the peer
    /// * `own_kem` - Our own ML-KEM secret key
    /// * `peer_ecdh` - The peer's ephemeral X25519 public key
    /// * `own_ecdh` - Our own ephemeral X25519 keypair
    pub fn decapsulate(
        ct: &mlkem::Ciphertext,
        own_kem: &mlkem::SecretKey,
        peer_ecdh: &x25519::X25519PublicKey,
        own_ecdh: &x25519::X25519KeyPair,
    ) -> Result<HybridSecrets> {
        let pq = mlkem::MlKem::decapsulate(own_kem, ct)?;
        let ecdh = own_ecdh.diffie_hellman(peer_ecdh);

        Ok(HybridSecrets { pq, ecdh })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hybrid_roundtrip() {
        let initiator = EphemeralKeys::generate();
        let responder = EphemeralKeys::generate();

        let (ct, resp_secrets) = HybridKem::encapsulate(
            &initiator.kem_public,
            initiator.ecdh.public_key(),
            &responder.ecdh,
        )
        .unwrap();

        let init_secrets = HybridKem::decapsulate(
            &ct,
            &initiator.kem_secret,
            responder.ecdh.public_key(),
            &initiator.ecdh,
        )
        .unwrap();

        assert_eq!(init_secrets.pq.0, resp_secrets.pq.0);
        assert_eq!(init_secrets.ecdh.0, resp_secrets.ecdh.0);
        assert_eq!(*init_secrets.ikm(), *resp_secrets.ikm());
    }

    #[test]
    fn test_ikm_layout() {
        let a = EphemeralKeys::generate();
        let b = EphemeralKeys::generate();

        let (_, secrets) =
            HybridKem::encapsulate(&a.kem_public, a.ecdh.public_key(), &b.ecdh).unwrap();

        let ikm = secrets.ikm();
        assert_eq!(&ikm[..32], &secrets.pq.0);
        assert_eq!(&ikm[32..], &secrets.ecdh.0);
    }

    #[test]
    fn test_wipe_clears_secrets() {
        let a = EphemeralKeys::generate();
        let b = EphemeralKeys::generate();

        let (_, mut secrets) =
            HybridKem::encapsulate(&a.kem_public, a.ecdh.public_key(), &b.ecdh).unwrap();
        secrets.wipe();

        assert_eq!(secrets.pq.0, [0u8; 32]);
        assert_eq!(secrets.ecdh.0, [0u8; 32]);
    }
}
