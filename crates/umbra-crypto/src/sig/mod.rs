//! Digital signature schemes

pub mod ed25519;
pub mod hybrid;
pub mod mldsa;

pub use ed25519::Ed25519Signer;
pub use hybrid::{HybridPublicKey, HybridSignature, HybridSigner};
