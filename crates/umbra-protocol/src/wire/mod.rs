//! Wire protocol encoding/decoding
//!
//! Every message on the transport starts with the fixed 15-byte header
//! defined in [`header`]; [`messages`] holds the typed message bodies with
//! exact byte layouts, and [`codec`] turns them into transport frames.

pub mod codec;
pub mod header;
pub mod messages;

pub use codec::{decode, encode, Decoded, Phase};
pub use header::{Header, FLAG_BATCH, FLAG_KEY_ROTATION, HEADER_LEN, PROTOCOL_VERSION};
pub use messages::{Message, SessionId, SESSION_ID_LEN};
