//! Command handlers

pub mod keygen;
pub mod status;
pub mod up;

use serde::{Deserialize, Serialize};
use umbra_crypto::sig::HybridPublicKey;

/// Shareable public identity bundle (`umbra export` / `--peer`)
#[derive(Serialize, Deserialize)]
pub struct PeerBundle {
    /// The peer's NodeID (hash of its classical public key)
    pub node_id: [u8; 32],
    /// The peer's hybrid identity public key
    pub key: HybridPublicKey,
}
