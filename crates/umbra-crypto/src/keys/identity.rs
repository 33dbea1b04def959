//! Long-term identity key pairs

use crate::sig::HybridSigner;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Node identifier: 32-byte BLAKE3 hash of the classical (Ed25519) public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Derive a NodeID from an Ed25519 verifying key
    pub fn from_classical_key(ed25519_public: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(crate::hash::domain::DOMAIN_NODE_ID);
        hasher.update(ed25519_public);
        Self(hasher.finalize().into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 32-byte slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Hex representation (lowercase, no prefix)
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short fingerprint form for logs
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// Identity key pair: hybrid signing keys plus the derived NodeID
#[derive(Clone, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
pub struct IdentityKeyPair {
    signer: HybridSigner,
    #[zeroize(skip)]
    id: NodeId,
}

impl IdentityKeyPair {
    /// Generate a new identity keypair
    pub fn generate() -> Self {
        let signer = HybridSigner::keygen();
        let id = NodeId::from_classical_key(&signer.public_key().ed25519);

        Self { signer, id }
    }

    /// Reassemble an identity from a stored signer
    pub fn from_signer(signer: HybridSigner) -> Self {
        let id = NodeId::from_classical_key(&signer.public_key().ed25519);
        Self { signer, id }
    }

    /// Get the signer
    pub fn signer(&self) -> &HybridSigner {
        &self.signer
    }

    /// Get the NodeID
    pub fn id(&self) -> NodeId {
        self.id
    }
}
