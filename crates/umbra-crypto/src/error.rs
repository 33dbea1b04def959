//! Error types for cryptographic operations

use thiserror::Error;

/// Result type alias using CryptoError
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Error during key generation
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Error during encryption
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Error during decryption or tag verification
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Error during signing
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Error during signature verification
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Error during KEM encapsulation or decapsulation
    #[error("Encapsulation failed: {0}")]
    Encapsulation(String),

    /// Invalid key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// I/O error during keystore access
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        CryptoError::Io(e.to_string())
    }
}

impl From<bincode::Error> for CryptoError {
    fn from(e: bincode::Error) -> Self {
        CryptoError::Serialization(e.to_string())
    }
}
