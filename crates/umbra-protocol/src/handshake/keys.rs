//! Session key schedule
//!
//! All keys flow from the master secret through HKDF-SHA256:
//!
//! ```text
//! master_secret = KDF(ikm = pq ‖ ecdh, salt = "MasterSecret", info = "", 32)
//! tx_key        = KDF(master, "TX",     session_id ‖ self_id ‖ peer_id, 32)
//! rx_key        = KDF(master, "RX",     session_id ‖ peer_id ‖ self_id, 32)
//! tx_salt       = KDF(master, "TXSalt", session_id ‖ self_id ‖ peer_id, 4)
//! rx_salt       = KDF(master, "RXSalt", session_id ‖ peer_id ‖ self_id, 4)
//! ```
//!
//! The deliberate `info` asymmetry makes A's TX equal B's RX: the identities
//! swap positions on the other side. The migration secret is the only
//! derived value that outlives the schedule; the master secret itself is
//! wiped as soon as the session keys exist.

use crate::wire::SessionId;
use crate::Result;
use umbra_crypto::hash::{blake3, domain};
use umbra_crypto::kdf::hkdf;
use umbra_crypto::kem::HybridSecrets;
use umbra_crypto::NodeId;
use zeroize::Zeroizing;

/// Directional session keys plus nonce salts
pub struct SessionKeys {
    /// Key for frames this node sends
    pub tx_key: Zeroizing<[u8; 32]>,
    /// Key for frames this node receives
    pub rx_key: Zeroizing<[u8; 32]>,
    /// Nonce salt for the send direction
    pub tx_salt: [u8; 4],
    /// Nonce salt for the receive direction
    pub rx_salt: [u8; 4],
    /// Retained only when both peers can migrate to a direct transport
    pub migration: Option<MigrationSecret>,
}

/// The master secret derived from the combined KEM and ECDH secrets
///
/// Lives only for the duration of the key schedule; zeroized on drop.
pub struct MasterSecret(Zeroizing<[u8; 32]>);

impl MasterSecret {
    /// Derive the master secret from the hybrid shared secrets
    pub fn derive(secrets: &HybridSecrets) -> Result<Self> {
        let ikm = secrets.ikm();
        let key = hkdf::derive_key32(b"MasterSecret", ikm.as_ref(), b"")?;
        Ok(Self(Zeroizing::new(key)))
    }

    /// Handshake proof: `MAC(master_secret, nonce)`
    pub fn proof(&self, nonce: &[u8; 16]) -> [u8; 32] {
        blake3::keyed_hash(&self.0, nonce)
    }

    /// Derive the directional session keys for this node
    ///
    /// `retain_migration` keeps a migration secret for the relay→direct
    /// switch; everything else derived here is directional and mirrored on
    /// the peer.
    pub fn session_keys(
        &self,
        session_id: &SessionId,
        self_id: &NodeId,
        peer_id: &NodeId,
        retain_migration: bool,
    ) -> Result<SessionKeys> {
        let tx_info = info(session_id, self_id, peer_id);
        let rx_info = info(session_id, peer_id, self_id);

        let tx_key = Zeroizing::new(hkdf::derive_key32(b"TX", self.0.as_ref(), &tx_info)?);
        let rx_key = Zeroizing::new(hkdf::derive_key32(b"RX", self.0.as_ref(), &rx_info)?);

        let tx_salt = salt4(hkdf::derive(b"TXSalt", self.0.as_ref(), &tx_info, 4)?);
        let rx_salt = salt4(hkdf::derive(b"RXSalt", self.0.as_ref(), &rx_info, 4)?);

        let migration = if retain_migration {
            let secret =
                hkdf::derive_key32(b"Migrate", self.0.as_ref(), session_id.as_bytes())?;
            Some(MigrationSecret(Zeroizing::new(secret)))
        } else {
            None
        };

        Ok(SessionKeys {
            tx_key,
            rx_key,
            tx_salt,
            rx_salt,
            migration,
        })
    }
}

/// Secret retained for the relay→direct transport migration
///
/// Derived from the master secret during the schedule; the short direct-path
/// re-handshake is authenticated by a MAC under this secret and produces
/// fresh directional keys without repeating the KEM exchange.
#[derive(Clone)]
pub struct MigrationSecret(Zeroizing<[u8; 32]>);

impl MigrationSecret {
    /// Proof for the direct-path re-handshake
    pub fn proof(&self, session_id: &SessionId) -> [u8; 32] {
        let mut data = Vec::with_capacity(domain::DOMAIN_MIGRATION_PROOF.len() + 16);
        data.extend_from_slice(domain::DOMAIN_MIGRATION_PROOF.as_bytes());
        data.extend_from_slice(session_id.as_bytes());
        blake3::keyed_hash(&self.0, &data)
    }

    /// Derive fresh directional keys for the direct transport
    ///
    /// Epoch-labeled so the direct keys are disjoint from the relay keys
    /// even though both descend from the same handshake.
    pub fn direct_keys(
        &self,
        session_id: &SessionId,
        self_id: &NodeId,
        peer_id: &NodeId,
    ) -> Result<SessionKeys> {
        let mut tx_info = info(session_id, self_id, peer_id);
        tx_info.extend_from_slice(b"direct");
        let mut rx_info = info(session_id, peer_id, self_id);
        rx_info.extend_from_slice(b"direct");

        let tx_key = Zeroizing::new(hkdf::derive_key32(b"TX", self.0.as_ref(), &tx_info)?);
        let rx_key = Zeroizing::new(hkdf::derive_key32(b"RX", self.0.as_ref(), &rx_info)?);

        let tx_salt = salt4(hkdf::derive(b"TXSalt", self.0.as_ref(), &tx_info, 4)?);
        let rx_salt = salt4(hkdf::derive(b"RXSalt", self.0.as_ref(), &rx_info, 4)?);

        Ok(SessionKeys {
            tx_key,
            rx_key,
            tx_salt,
            rx_salt,
            migration: None,
        })
    }
}

fn info(session_id: &SessionId, first: &NodeId, second: &NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 32 + 32);
    out.extend_from_slice(session_id.as_bytes());
    out.extend_from_slice(first.as_bytes());
    out.extend_from_slice(second.as_bytes());
    out
}

fn salt4(bytes: Vec<u8>) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::kem::hybrid::EphemeralKeys;
    use umbra_crypto::kem::HybridKem;

    fn shared_master() -> (MasterSecret, MasterSecret) {
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

        (
            MasterSecret::derive(&init_secrets).unwrap(),
            MasterSecret::derive(&resp_secrets).unwrap(),
        )
    }

    #[test]
    fn test_directional_keys_mirror() {
        let (master_a, master_b) = shared_master();
        let session_id = SessionId([5u8; 16]);
        let id_a = NodeId([1u8; 32]);
        let id_b = NodeId([2u8; 32]);

        let keys_a = master_a.session_keys(&session_id, &id_a, &id_b, false).unwrap();
        let keys_b = master_b.session_keys(&session_id, &id_b, &id_a, false).unwrap();

        // A's TX is B's RX, bit for bit — and vice versa
        assert_eq!(*keys_a.tx_key, *keys_b.rx_key);
        assert_eq!(*keys_a.rx_key, *keys_b.tx_key);
        assert_eq!(keys_a.tx_salt, keys_b.rx_salt);
        assert_eq!(keys_a.rx_salt, keys_b.tx_salt);
    }

    #[test]
    fn test_role_separation() {
        let (master_a, _) = shared_master();
        let session_id = SessionId([5u8; 16]);
        let id_a = NodeId([1u8; 32]);
        let id_b = NodeId([2u8; 32]);

        let keys = master_a.session_keys(&session_id, &id_a, &id_b, false).unwrap();
        assert_ne!(*keys.tx_key, *keys.rx_key);
    }

    #[test]
    fn test_proof_agreement() {
        let (master_a, master_b) = shared_master();
        let nonce = [9u8; 16];

        assert_eq!(master_a.proof(&nonce), master_b.proof(&nonce));
        assert_ne!(master_a.proof(&nonce), master_a.proof(&[8u8; 16]));
    }

    #[test]
    fn test_direct_keys_disjoint_from_relay_keys() {
        let (master_a, master_b) = shared_master();
        let session_id = SessionId([5u8; 16]);
        let id_a = NodeId([1u8; 32]);
        let id_b = NodeId([2u8; 32]);

        let relay_a = master_a.session_keys(&session_id, &id_a, &id_b, true).unwrap();
        let relay_b = master_b.session_keys(&session_id, &id_b, &id_a, true).unwrap();

        let direct_a = relay_a
            .migration
            .as_ref()
            .unwrap()
            .direct_keys(&session_id, &id_a, &id_b)
            .unwrap();
        let direct_b = relay_b
            .migration
            .as_ref()
            .unwrap()
            .direct_keys(&session_id, &id_b, &id_a)
            .unwrap();

        // Direct keys still mirror across peers
        assert_eq!(*direct_a.tx_key, *direct_b.rx_key);
        assert_eq!(*direct_a.rx_key, *direct_b.tx_key);

        // But are disjoint from the relay-epoch keys
        assert_ne!(*direct_a.tx_key, *relay_a.tx_key);
        assert_ne!(*direct_a.rx_key, *relay_a.rx_key);
    }

    #[test]
    fn test_migration_proof_agreement() {
        let (master_a, master_b) = shared_master();
        let session_id = SessionId([5u8; 16]);
        let id_a = NodeId([1u8; 32]);
        let id_b = NodeId([2u8; 32]);

        let keys_a = master_a.session_keys(&session_id, &id_a, &id_b, true).unwrap();
        let keys_b = master_b.session_keys(&session_id, &id_b, &id_a, true).unwrap();

        assert_eq!(
            keys_a.migration.as_ref().unwrap().proof(&session_id),
            keys_b.migration.as_ref().unwrap().proof(&session_id)
        );
    }
}
