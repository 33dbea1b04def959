//! ChaCha20-Poly1305 AEAD
//!
//! 256-bit key, 12-byte nonce, 16-byte tag appended to the ciphertext.
//! Tag verification is constant-time inside the cipher and fails closed:
//! no plaintext is released on authentication failure.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use crate::error::{CryptoError, Result};

/// Encrypt and authenticate a frame
///
/// # Arguments
///
/// * `key` - 32-byte encryption key
/// * `nonce` - 12-byte nonce (must be unique per key)
/// * `plaintext` - Data to encrypt
/// * `aad` - Additional authenticated data (bound but not encrypted)
///
/// # Returns
///
/// Ciphertext with the 16-byte authentication tag appended
pub fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce);

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    cipher
        .encrypt(nonce, payload)
        .map_err(|e| CryptoError::Encryption(format!("AEAD seal failed: {}", e)))
}

/// Decrypt and verify a frame
///
/// # Arguments
///
/// * `key` - 32-byte encryption key
/// * `nonce` - 12-byte nonce (must match the sealing nonce)
/// * `ciphertext` - Ciphertext with appended tag
/// * `aad` - Additional authenticated data (must match the sealing AAD)
///
/// # Returns
///
/// The plaintext, or an authentication failure with no partial output
pub fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce);

    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher
        .decrypt(nonce, payload)
        .map_err(|e| CryptoError::Decryption(format!("AEAD open failed: {}", e)))
}
