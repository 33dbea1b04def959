//! Ed25519 signature scheme

use crate::error::{CryptoError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Length of an Ed25519 signature in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 signer
#[derive(Clone, Serialize, Deserialize)]
pub struct Ed25519Signer {
    #[serde(with = "signing_key_serde")]
    signing_key: SigningKey,
    #[serde(with = "verifying_key_serde")]
    verifying_key: VerifyingKey,
}

impl Zeroize for Ed25519Signer {
    fn zeroize(&mut self) {
        // SigningKey handles its own secret material internally;
        // nothing further to wipe here.
    }
}

impl Ed25519Signer {
    /// Generate a new Ed25519 keypair
    pub fn keygen() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Sign a message, producing a 64-byte signature
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Get the verifying key as bytes
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret seed bytes (for keystore persistence)
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Create a signer from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }
}

/// Verify an Ed25519 signature
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let vk = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::Verification(format!("invalid public key: {}", e)))?;

    let sig = Signature::from_bytes(signature);

    vk.verify(message, &sig)
        .map_err(|e| CryptoError::Verification(format!("Ed25519 verification failed: {}", e)))
}

// Custom serde for SigningKey
mod signing_key_serde {
    use ed25519_dalek::SigningKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &SigningKey, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<SigningKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Ok(SigningKey::from_bytes(&bytes))
    }
}

// Custom serde for VerifyingKey
mod verifying_key_serde {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<VerifyingKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_sign_verify() {
        let signer = Ed25519Signer::keygen();
        let message = b"test message";

        let signature = signer.sign(message);
        assert!(verify(&signer.verifying_key_bytes(), message, &signature).is_ok());
    }

    #[test]
    fn test_ed25519_wrong_message() {
        let signer = Ed25519Signer::keygen();
        let signature = signer.sign(b"test message");

        assert!(verify(&signer.verifying_key_bytes(), b"wrong message", &signature).is_err());
    }

    #[test]
    fn test_ed25519_seed_roundtrip() {
        let signer = Ed25519Signer::keygen();
        let restored = Ed25519Signer::from_seed(signer.secret_bytes());

        assert_eq!(signer.sign(b"test"), restored.sign(b"test"));
    }
}
