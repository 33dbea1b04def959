//! Peer authorization for incoming handshakes
//!
//! A responder verifies the HELLO signature against a key it already trusts
//! for the claimed NodeID. The trusted key comes from a registry populated
//! by the discovery layer, or from a trust-on-first-use store that pins keys
//! as they are learned. There is deliberately no accept-any implementation.

use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use umbra_crypto::sig::HybridPublicKey;
use umbra_crypto::NodeId;

/// Source of trusted peer identity keys
pub trait PeerVerifier: Send + Sync {
    /// The trusted hybrid public key for `node`, or `None` to reject
    fn trusted_key(&self, node: &NodeId) -> Option<HybridPublicKey>;
}

/// Static registry of peer keys, populated from discovery or configuration
#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<NodeId, HybridPublicKey>>,
}

impl KeyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a peer key
    pub fn insert(&self, node: NodeId, key: HybridPublicKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(node, key);
        }
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.keys.read().map(|k| k.len()).unwrap_or(0)
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerVerifier for KeyRegistry {
    fn trusted_key(&self, node: &NodeId) -> Option<HybridPublicKey> {
        self.keys.read().ok()?.get(node).cloned()
    }
}

/// Trust-on-first-use key store
///
/// The first key learned for a NodeID is pinned; a later attempt to learn a
/// different key for the same NodeID is rejected. Keys enter through
/// [`TofuStore::learn`], which the discovery layer calls when it resolves a
/// peer.
#[derive(Default)]
pub struct TofuStore {
    pinned: RwLock<HashMap<NodeId, HybridPublicKey>>,
}

impl TofuStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a key on first sight; reject a conflicting key for a known node
    pub fn learn(&self, node: NodeId, key: HybridPublicKey) -> Result<()> {
        let mut pinned = self
            .pinned
            .write()
            .map_err(|_| ProtocolError::Violation("trust store poisoned".to_string()))?;

        match pinned.get(&node) {
            None => {
                pinned.insert(node, key);
                Ok(())
            }
            Some(existing) if *existing == key => Ok(()),
            Some(_) => Err(ProtocolError::Crypto(format!(
                "identity key for {} conflicts with pinned key",
                node
            ))),
        }
    }
}

impl PeerVerifier for TofuStore {
    fn trusted_key(&self, node: &NodeId) -> Option<HybridPublicKey> {
        self.pinned.read().ok()?.get(node).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::IdentityKeyPair;

    #[test]
    fn test_registry_lookup() {
        let registry = KeyRegistry::new();
        let identity = IdentityKeyPair::generate();

        assert!(registry.trusted_key(&identity.id()).is_none());

        registry.insert(identity.id(), identity.signer().public_key());
        let key = registry.trusted_key(&identity.id()).unwrap();
        assert_eq!(key.ed25519, identity.signer().public_key().ed25519);
    }

    #[test]
    fn test_tofu_pins_first_key() {
        let store = TofuStore::new();
        let identity = IdentityKeyPair::generate();
        let impostor = IdentityKeyPair::generate();

        store
            .learn(identity.id(), identity.signer().public_key())
            .unwrap();

        // Re-learning the same key is fine
        store
            .learn(identity.id(), identity.signer().public_key())
            .unwrap();

        // A different key for the same node is rejected
        let conflict = store.learn(identity.id(), impostor.signer().public_key());
        assert!(matches!(conflict, Err(ProtocolError::Crypto(_))));

        // The original pin survives
        let key = store.trusted_key(&identity.id()).unwrap();
        assert_eq!(key.ed25519, identity.signer().public_key().ed25519);
    }
}
