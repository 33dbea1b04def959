//! BLAKE3 hash function wrappers

use blake3::{derive_key as blake3_derive_key, Hasher};

/// Hash data using BLAKE3
///
/// # Returns
///
/// 32-byte BLAKE3 hash
pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Keyed hash using BLAKE3 in MAC mode
///
/// Used for the handshake proof: `MAC(master_secret, challenge_nonce)`.
///
/// # Returns
///
/// 32-byte MAC tag
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new_keyed(key);
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive a key using BLAKE3 KDF mode
///
/// # Returns
///
/// 32-byte derived key
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    blake3_derive_key(context, key_material)
}
