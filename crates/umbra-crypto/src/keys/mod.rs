//! Long-term identity keys and the on-disk keystore

pub mod identity;
pub mod keystore;

pub use identity::{IdentityKeyPair, NodeId};
pub use keystore::Keystore;
