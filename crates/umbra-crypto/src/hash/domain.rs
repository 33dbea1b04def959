//! Domain separation constants for cryptographic operations
//!
//! These constants ensure that operations in different contexts produce
//! different outputs, even with the same inputs.

/// Domain separator for NodeID derivation from the classical public key
pub const DOMAIN_NODE_ID: &str = "umbra.node_id.v1";

/// Domain separator for the handshake proof MAC
pub const DOMAIN_HANDSHAKE_PROOF: &str = "umbra.handshake.proof.v1";

/// Domain separator for the migration proof MAC
pub const DOMAIN_MIGRATION_PROOF: &str = "umbra.migration.proof.v1";

/// Domain separator for frame deduplication digests during transport switchover
pub const DOMAIN_FRAME_DEDUP: &str = "umbra.frame.dedup.v1";
