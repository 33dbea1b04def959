//! Fixed wire header
//!
//! Layout (15 bytes):
//!
//! ```text
//! version(1) ‖ type(1) ‖ flags(1) ‖ length(4, BE) ‖ sequence(8, BE)
//! ```
//!
//! `length` is the payload length in bytes. `sequence` is the per-direction
//! monotonic frame counter for DATA messages and zero for control traffic.

use crate::{ProtocolError, Result};
use bytes::{Buf, BufMut};

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header length in bytes
pub const HEADER_LEN: usize = 15;

/// Flag bit 0: this handshake message re-keys an existing session
pub const FLAG_KEY_ROTATION: u8 = 0b0000_0001;

/// Flag bit 1: payload carries multiple batched frames
pub const FLAG_BATCH: u8 = 0b0000_0010;

/// Message types with the high bit (0x80) set are optional extensions:
/// a peer that does not understand them ignores them once established.
pub const TYPE_EXTENSION_BIT: u8 = 0x80;

/// Parsed wire header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (must equal [`PROTOCOL_VERSION`])
    pub version: u8,
    /// Message type code
    pub msg_type: u8,
    /// Flag bits
    pub flags: u8,
    /// Payload length in bytes
    pub length: u32,
    /// Monotonic per-direction sequence (DATA frames) or zero
    pub sequence: u64,
}

impl Header {
    /// Encode into a buffer
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type);
        buf.put_u8(self.flags);
        buf.put_u32(self.length);
        buf.put_u64(self.sequence);
    }

    /// Decode from the front of `buf`, advancing it past the header
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "truncated header: {} bytes",
                buf.remaining()
            )));
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionUnsupported(version));
        }

        Ok(Self {
            version,
            msg_type: buf.get_u8(),
            flags: buf.get_u8(),
            length: buf.get_u32(),
            sequence: buf.get_u64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            version: PROTOCOL_VERSION,
            msg_type: 0x10,
            flags: FLAG_KEY_ROTATION,
            length: 1234,
            sequence: 0xDEAD_BEEF_0000_0001,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = Header::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_layout() {
        let header = Header {
            version: 1,
            msg_type: 2,
            flags: 3,
            length: 0x04050607,
            sequence: 0x08090A0B0C0D0E0F,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[1, 2, 3, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]
        );
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf = BytesMut::new();
        Header {
            version: 2,
            msg_type: 0,
            flags: 0,
            length: 0,
            sequence: 0,
        }
        .encode(&mut buf);

        match Header::decode(&mut buf.freeze()) {
            Err(ProtocolError::VersionUnsupported(2)) => {}
            other => panic!("expected VersionUnsupported, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut short = bytes::Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(
            Header::decode(&mut short),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
