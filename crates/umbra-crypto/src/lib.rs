//! # Umbra Cryptography Library
//!
//! Cryptographic primitives for the Umbra mesh VPN: hybrid post-quantum KEM
//! (ML-KEM-1024 + X25519), hybrid signatures (ML-DSA + Ed25519), AEAD frame
//! encryption, HKDF key derivation, and long-term identity keys.
//!
//! Hybrid constructions are conjunctive: a signature verifies only if both
//! components verify, and the KEM shared secrets stay separate until the KDF
//! combines them, so security holds as long as either component is unbroken.

#![warn(missing_docs)]

pub mod error;
pub mod hash;
pub mod kdf;
pub mod kem;
pub mod keys;
pub mod mem;
pub mod sig;
pub mod symmetric;

pub use error::{CryptoError, Result};
pub use keys::{IdentityKeyPair, NodeId};

/// Library version constant
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize process-level hardening (e.g. disable core dumps)
///
/// Call once at application startup, before any key material is loaded.
pub fn init() -> Result<()> {
    mem::wipe::prevent_core_dumps()?;
    Ok(())
}
