//! Four-message hybrid post-quantum handshake
//!
//! HELLO → CHALLENGE → RESPONSE → ESTABLISHED, driven on either side by an
//! event-style state machine. The machine is pure protocol logic: the
//! connection driver owns the transport, feeds decoded messages in, and
//! enforces the overall handshake deadline.

pub mod keys;
pub mod machine;
pub mod verifier;

pub use keys::{MasterSecret, MigrationSecret, SessionKeys};
pub use machine::{
    HandshakeConfig, HandshakeMachine, HandshakeOutput, HandshakeState, PeerDirectInfo,
    PendingSession, Role,
};
pub use verifier::{KeyRegistry, PeerVerifier, TofuStore};
