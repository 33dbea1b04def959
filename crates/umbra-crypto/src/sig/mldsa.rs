//! ML-DSA (Dilithium) signature scheme
//!
//! Uses detached signatures: the wire carries message and signature as
//! separate fields, so the attached `sign`/`open` API does not fit.

use crate::error::{CryptoError, Result};
use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Length of a detached ML-DSA signature in bytes
pub fn signature_len() -> usize {
    dilithium5::signature_bytes()
}

/// ML-DSA-87 signer (Dilithium5)
#[derive(Clone, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
pub struct MlDsaSigner {
    public_key: Vec<u8>,
    secret_key: Vec<u8>,
}

impl MlDsaSigner {
    /// Generate a new ML-DSA keypair
    pub fn keygen() -> Self {
        let (pk, sk) = dilithium5::keypair();
        Self {
            public_key: pk.as_bytes().to_vec(),
            secret_key: sk.as_bytes().to_vec(),
        }
    }

    /// Sign a message, producing a detached signature
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sk = dilithium5::SecretKey::from_bytes(&self.secret_key)
            .map_err(|_| CryptoError::Signing("invalid ML-DSA secret key".to_string()))?;

        let sig = dilithium5::detached_sign(message, &sk);
        Ok(sig.as_bytes().to_vec())
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key
    }

    /// Reconstruct a signer from stored key bytes
    pub fn from_parts(public_key: Vec<u8>, secret_key: Vec<u8>) -> Result<Self> {
        if public_key.len() != dilithium5::public_key_bytes() {
            return Err(CryptoError::InvalidKey(
                "invalid ML-DSA public key length".to_string(),
            ));
        }
        if secret_key.len() != dilithium5::secret_key_bytes() {
            return Err(CryptoError::InvalidKey(
                "invalid ML-DSA secret key length".to_string(),
            ));
        }
        Ok(Self {
            public_key,
            secret_key,
        })
    }
}

/// Verify a detached ML-DSA signature
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let pk = dilithium5::PublicKey::from_bytes(public_key)
        .map_err(|_| CryptoError::Verification("invalid ML-DSA public key".to_string()))?;

    let sig = dilithium5::DetachedSignature::from_bytes(signature)
        .map_err(|_| CryptoError::Verification("invalid ML-DSA signature".to_string()))?;

    dilithium5::verify_detached_signature(&sig, message, &pk)
        .map_err(|_| CryptoError::Verification("ML-DSA verification failed".to_string()))
}
