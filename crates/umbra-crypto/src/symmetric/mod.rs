//! Symmetric encryption for the frame pipeline

pub mod chacha20;
pub mod nonce;

pub use chacha20::{open, seal};
pub use nonce::FrameNonce;

/// AEAD authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// AEAD key length in bytes
pub const KEY_LEN: usize = 32;

/// Frame nonce length in bytes
pub const NONCE_LEN: usize = 12;
