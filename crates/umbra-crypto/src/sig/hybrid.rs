//! Hybrid signature combining ML-DSA and Ed25519
//!
//! Conjunctive construction: a hybrid signature verifies only if BOTH
//! component signatures verify, so forgery requires breaking both schemes.

use crate::error::{CryptoError, Result};
use crate::sig::{ed25519, mldsa};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Hybrid signature (ML-DSA ‖ Ed25519)
#[derive(Clone, Serialize, Deserialize)]
pub struct HybridSignature {
    /// Detached ML-DSA signature
    pub mldsa: Vec<u8>,
    /// Ed25519 signature
    #[serde(with = "serde_arrays")]
    pub ed25519: [u8; 64],
}

impl HybridSignature {
    /// Serialize as wire bytes: `pq_sig ‖ classical_sig`
    ///
    /// The Ed25519 component occupies the trailing 64 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.mldsa.len() + 64);
        out.extend_from_slice(&self.mldsa);
        out.extend_from_slice(&self.ed25519);
        out
    }

    /// Parse wire bytes back into the two components
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= ed25519::SIGNATURE_LEN {
            return Err(CryptoError::Verification(
                "hybrid signature too short".to_string(),
            ));
        }
        let split = bytes.len() - ed25519::SIGNATURE_LEN;
        let mut classical = [0u8; 64];
        classical.copy_from_slice(&bytes[split..]);

        Ok(Self {
            mldsa: bytes[..split].to_vec(),
            ed25519: classical,
        })
    }
}

// Custom serde for [u8; 64]
mod serde_arrays {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bytes.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec = Vec::<u8>::deserialize(deserializer)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

/// Hybrid signer holding both component keypairs
#[derive(Clone, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
pub struct HybridSigner {
    mldsa: mldsa::MlDsaSigner,
    ed25519: ed25519::Ed25519Signer,
}

impl HybridSigner {
    /// Generate a new hybrid keypair
    pub fn keygen() -> Self {
        Self {
            mldsa: mldsa::MlDsaSigner::keygen(),
            ed25519: ed25519::Ed25519Signer::keygen(),
        }
    }

    /// Reassemble a signer from its component parts
    pub fn from_parts(mldsa: mldsa::MlDsaSigner, ed25519: ed25519::Ed25519Signer) -> Self {
        Self { mldsa, ed25519 }
    }

    /// Sign a message with both algorithms
    pub fn sign(&self, message: &[u8]) -> Result<HybridSignature> {
        Ok(HybridSignature {
            mldsa: self.mldsa.sign(message)?,
            ed25519: self.ed25519.sign(message),
        })
    }

    /// Get the hybrid public key
    pub fn public_key(&self) -> HybridPublicKey {
        HybridPublicKey {
            mldsa: self.mldsa.public_key_bytes().to_vec(),
            ed25519: self.ed25519.verifying_key_bytes(),
        }
    }

    /// Access the ML-DSA component (for keystore persistence)
    pub fn mldsa(&self) -> &mldsa::MlDsaSigner {
        &self.mldsa
    }

    /// Access the Ed25519 component (for keystore persistence)
    pub fn ed25519(&self) -> &ed25519::Ed25519Signer {
        &self.ed25519
    }
}

/// Hybrid public key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridPublicKey {
    /// ML-DSA public key bytes
    pub mldsa: Vec<u8>,
    /// Ed25519 verifying key bytes
    pub ed25519: [u8; 32],
}

/// Verify a hybrid signature
///
/// Returns `Ok(())` iff BOTH component signatures verify.
pub fn verify(
    public_key: &HybridPublicKey,
    message: &[u8],
    signature: &HybridSignature,
) -> Result<()> {
    mldsa::verify(&public_key.mldsa, message, &signature.mldsa)?;
    ed25519::verify(&public_key.ed25519, message, &signature.ed25519)?;
    Ok(())
}
