//! HKDF (HMAC-based Key Derivation Function) implementation

use crate::error::{CryptoError, Result};
use hkdf::Hkdf;
use sha2::Sha256;

/// Derive key material using HKDF-SHA256
///
/// Extract-then-expand over SHA-256. This is the single KDF used by the
/// session key schedule; labels go into `salt` and context into `info`.
///
/// # Arguments
///
/// * `salt` - Salt / label value (use empty slice for no salt)
/// * `ikm` - Input key material
/// * `info` - Application-specific context information
/// * `len` - Length of output key material in bytes
pub fn derive(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expansion failed: {}", e)))?;

    Ok(okm)
}

/// Derive a fixed 32-byte key using HKDF-SHA256
pub fn derive_key32(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expansion failed: {}", e)))?;

    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_deterministic() {
        let key1 = derive(b"salt", b"input key material", b"context", 32).unwrap();
        let key2 = derive(b"salt", b"input key material", b"context", 32).unwrap();

        assert_eq!(key1, key2);
        assert_eq!(key1.len(), 32);
    }

    #[test]
    fn test_hkdf_different_info() {
        let key1 = derive(b"salt", b"ikm", b"context1", 32).unwrap();
        let key2 = derive(b"salt", b"ikm", b"context2", 32).unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_hkdf_different_salt() {
        let key1 = derive(b"TX", b"ikm", b"context", 32).unwrap();
        let key2 = derive(b"RX", b"ikm", b"context", 32).unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_derive_key32_matches_derive() {
        let a = derive(b"salt", b"ikm", b"info", 32).unwrap();
        let b = derive_key32(b"salt", b"ikm", b"info").unwrap();
        assert_eq!(a, b.to_vec());
    }
}
