//! Key encapsulation mechanisms

pub mod hybrid;
pub mod mlkem;
pub mod x25519;

pub use hybrid::{HybridKem, HybridSecrets};
pub use x25519::{X25519KeyPair, X25519PublicKey};
