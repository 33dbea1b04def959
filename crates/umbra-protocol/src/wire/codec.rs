//! Codec: typed messages ⇄ transport frames
//!
//! One encoded message maps to one transport message. Decoding enforces the
//! header invariants (version, exact length) and the phase-dependent policy
//! for unknown types: unknown types are always malformed during the
//! handshake; once established, types with the extension bit set are
//! skipped for forward compatibility and the rest are protocol violations.

use crate::wire::header::{Header, HEADER_LEN, PROTOCOL_VERSION, TYPE_EXTENSION_BIT};
use crate::wire::messages::{msg_type, Message};
use crate::{ProtocolError, Result};
use bytes::{Bytes, BytesMut};

/// Connection phase, which decides the unknown-type policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the session exists: only handshake and control types are legal
    Handshake,
    /// Steady state
    Established,
}

/// Result of decoding one transport message
pub enum Decoded {
    /// A well-formed message
    Message {
        /// The parsed header
        header: Header,
        /// The parsed message body
        message: Message,
    },
    /// An unknown extension type, skipped in the established phase
    IgnoredExtension {
        /// The unknown type code
        msg_type: u8,
    },
}

/// Encode a message into a transport frame
///
/// `sequence` is the per-direction frame counter for DATA messages and zero
/// for control traffic. `flags` carries the header flag bits.
pub fn encode(message: &Message, flags: u8, sequence: u64) -> Bytes {
    let mut payload = BytesMut::new();
    message.encode_payload(&mut payload);

    let header = Header {
        version: PROTOCOL_VERSION,
        msg_type: message.msg_type(),
        flags,
        length: payload.len() as u32,
        sequence,
    };

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.encode(&mut out);
    out.extend_from_slice(&payload);
    out.freeze()
}

/// Decode one transport frame
pub fn decode(bytes: &[u8], phase: Phase) -> Result<Decoded> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let header = Header::decode(&mut buf)?;

    if buf.len() != header.length as usize {
        return Err(ProtocolError::Malformed(format!(
            "length mismatch: header says {}, payload is {}",
            header.length,
            buf.len()
        )));
    }

    if !is_known_type(header.msg_type) {
        return match phase {
            Phase::Handshake => Err(ProtocolError::Malformed(format!(
                "unknown message type {:#04x} during handshake",
                header.msg_type
            ))),
            Phase::Established if header.msg_type & TYPE_EXTENSION_BIT != 0 => {
                Ok(Decoded::IgnoredExtension {
                    msg_type: header.msg_type,
                })
            }
            Phase::Established => Err(ProtocolError::Violation(format!(
                "unknown required message type {:#04x}",
                header.msg_type
            ))),
        };
    }

    let message = Message::decode_payload(header.msg_type, buf)?;
    Ok(Decoded::Message { header, message })
}

fn is_known_type(t: u8) -> bool {
    matches!(
        t,
        msg_type::HELLO
            | msg_type::CHALLENGE
            | msg_type::RESPONSE
            | msg_type::ESTABLISHED
            | msg_type::DATA
            | msg_type::HEARTBEAT
            | msg_type::HEARTBEAT_ACK
            | msg_type::ERROR
            | msg_type::CLOSE
    )
}
