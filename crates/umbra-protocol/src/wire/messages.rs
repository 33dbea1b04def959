//! Typed wire messages with exact byte layouts
//!
//! Handshake messages concatenate fixed-size fields in a fixed order; the
//! hybrid signature is always the trailing field, with the Ed25519 component
//! in the last 64 bytes. Multi-byte integers are big-endian.

use crate::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use umbra_crypto::kem::mlkem;
use umbra_crypto::sig::HybridSignature;
use umbra_crypto::NodeId;

/// Length of a session identifier in bytes.
///
/// This is the single canonical size; the codec rejects any deviation.
pub const SESSION_ID_LEN: usize = 16;

/// Length of the challenge nonce in bytes
pub const NONCE_LEN: usize = 16;

/// Opaque session identifier chosen by the responder
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a fresh random session id
    pub fn random() -> Self {
        let mut id = [0u8; SESSION_ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut id[..]);
        Self(id)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }

    /// Full hex representation
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// Message type codes
pub mod msg_type {
    /// Initiator hello with ephemeral public keys
    pub const HELLO: u8 = 0x01;
    /// Responder challenge with KEM ciphertext and nonce
    pub const CHALLENGE: u8 = 0x02;
    /// Initiator proof of the derived master secret
    pub const RESPONSE: u8 = 0x03;
    /// Responder session parameters
    pub const ESTABLISHED: u8 = 0x04;
    /// Encrypted data frame
    pub const DATA: u8 = 0x10;
    /// Keepalive probe
    pub const HEARTBEAT: u8 = 0x20;
    /// Keepalive reply
    pub const HEARTBEAT_ACK: u8 = 0x21;
    /// Error report
    pub const ERROR: u8 = 0x30;
    /// Graceful close
    pub const CLOSE: u8 = 0x31;
}

/// Error codes carried in ERROR messages
pub mod error_code {
    /// Peer protocol version is not supported
    pub const VERSION_UNSUPPORTED: u16 = 1;
    /// Listener at capacity
    pub const SERVICE_UNAVAILABLE: u16 = 2;
    /// Relay could not pair the peers
    pub const PAIRING_FAILED: u16 = 3;
}

/// Close codes carried in CLOSE messages
pub mod close_code {
    /// Normal shutdown
    pub const NORMAL: u16 = 1000;
    /// Node is shutting down
    pub const GOING_AWAY: u16 = 1001;
    /// Peer violated the protocol state machine or sent malformed bytes
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Signature, decapsulation, AEAD, or proof failure
    pub const CRYPTO_FAILURE: u16 = 4000;
    /// Policy rejected the peer (authorization, capability conflict)
    pub const POLICY_VIOLATION: u16 = 4001;
    /// Internal error
    pub const INTERNAL_ERROR: u16 = 4002;
}

/// HELLO: opens a handshake (or a key rotation when the header flag is set)
#[derive(Clone)]
pub struct Hello {
    /// Initiator's NodeID
    pub client_id: NodeId,
    /// Ephemeral ML-KEM public key
    pub kem_public: mlkem::PublicKey,
    /// Ephemeral X25519 public key
    pub ecdh_public: [u8; 32],
    /// Nanoseconds since the Unix epoch (replay resistance)
    pub timestamp_ns: u64,
    /// Hybrid signature over all preceding fields
    pub signature: HybridSignature,
}

impl Hello {
    /// The exact bytes the signature covers: the encoded fields before it
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + mlkem::PUBLIC_KEY_LEN + 32 + 8);
        self.encode_prefix(&mut buf);
        buf
    }

    fn encode_prefix(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.client_id.as_bytes());
        buf.put_slice(self.kem_public.as_bytes());
        buf.put_slice(&self.ecdh_public);
        buf.put_u64(self.timestamp_ns);
    }
}

/// CHALLENGE: responder's half of the key agreement
#[derive(Clone)]
pub struct Challenge {
    /// Responder's NodeID
    pub responder_id: NodeId,
    /// Fresh session identifier chosen by the responder
    pub session_id: SessionId,
    /// ML-KEM ciphertext encapsulated to the initiator's KEM public key
    pub kem_ciphertext: mlkem::Ciphertext,
    /// Responder's ephemeral X25519 public key
    pub ecdh_public: [u8; 32],
    /// Fresh 16-byte challenge nonce
    pub nonce: [u8; NONCE_LEN],
    /// Nanoseconds since the Unix epoch
    pub timestamp_ns: u64,
    /// Hybrid signature over all preceding fields
    pub signature: HybridSignature,
}

impl Challenge {
    /// The exact bytes the signature covers
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(32 + SESSION_ID_LEN + mlkem::CIPHERTEXT_LEN + 32 + NONCE_LEN + 8);
        self.encode_prefix(&mut buf);
        buf
    }

    fn encode_prefix(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.responder_id.as_bytes());
        buf.put_slice(self.session_id.as_bytes());
        buf.put_slice(self.kem_ciphertext.as_bytes());
        buf.put_slice(&self.ecdh_public);
        buf.put_slice(&self.nonce);
        buf.put_u64(self.timestamp_ns);
    }
}

/// RESPONSE: initiator proves possession of the master secret
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
    /// Session identifier from the CHALLENGE
    pub session_id: SessionId,
    /// `MAC(master_secret, nonce)` over the challenge nonce
    pub proof: [u8; 32],
    /// Initiator capability bitmask
    pub capabilities: u32,
}

/// Peer TLS certificate pinned for the direct-P2P path
#[derive(Clone)]
pub struct DirectCert {
    /// DER-encoded self-signed certificate
    pub cert_der: Vec<u8>,
    /// Identity signature over `cert_der ‖ session_id`
    pub signature: HybridSignature,
}

/// ESTABLISHED: responder finalizes the session parameters
#[derive(Clone)]
pub struct Established {
    /// Session identifier
    pub session_id: SessionId,
    /// Negotiated MTU in bytes
    pub mtu: u16,
    /// Heartbeat interval in seconds
    pub heartbeat_secs: u16,
    /// Key-rotation interval in seconds
    pub rotation_secs: u32,
    /// Responder capability bitmask
    pub capabilities: u32,
    /// Responder's direct-P2P endpoint, if it accepts migration
    pub direct_endpoint: Option<SocketAddr>,
    /// Responder's pinned TLS certificate for the direct path
    pub direct_cert: Option<DirectCert>,
}

/// DATA: one encrypted frame
#[derive(Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Session the frame belongs to
    pub session_id: SessionId,
    /// Deterministic frame nonce (`salt ‖ counter`)
    pub nonce: [u8; 12],
    /// AEAD ciphertext with appended 16-byte tag
    pub ciphertext: Vec<u8>,
}

/// ERROR: error report with numeric code
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Numeric error code (see [`error_code`])
    pub code: u16,
    /// Human-readable description
    pub message: String,
}

/// CLOSE: graceful shutdown with numeric code
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseMessage {
    /// Numeric close code (see [`close_code`])
    pub code: u16,
    /// Human-readable reason
    pub reason: String,
}

/// A typed wire message
#[derive(Clone)]
pub enum Message {
    /// Handshake hello
    Hello(Hello),
    /// Handshake challenge
    Challenge(Box<Challenge>),
    /// Handshake response
    Response(Response),
    /// Handshake completion
    Established(Box<Established>),
    /// Encrypted data frame
    Data(DataFrame),
    /// Keepalive probe
    Heartbeat,
    /// Keepalive reply
    HeartbeatAck,
    /// Error report
    Error(ErrorMessage),
    /// Graceful close
    Close(CloseMessage),
}

impl Message {
    /// The wire type code for this message
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Hello(_) => msg_type::HELLO,
            Message::Challenge(_) => msg_type::CHALLENGE,
            Message::Response(_) => msg_type::RESPONSE,
            Message::Established(_) => msg_type::ESTABLISHED,
            Message::Data(_) => msg_type::DATA,
            Message::Heartbeat => msg_type::HEARTBEAT,
            Message::HeartbeatAck => msg_type::HEARTBEAT_ACK,
            Message::Error(_) => msg_type::ERROR,
            Message::Close(_) => msg_type::CLOSE,
        }
    }

    /// Encode the payload (everything after the header) into `buf`
    pub(crate) fn encode_payload(&self, buf: &mut impl BufMut) {
        match self {
            Message::Hello(hello) => {
                hello.encode_prefix(buf);
                buf.put_slice(&hello.signature.to_bytes());
            }
            Message::Challenge(challenge) => {
                challenge.encode_prefix(buf);
                buf.put_slice(&challenge.signature.to_bytes());
            }
            Message::Response(response) => {
                buf.put_slice(response.session_id.as_bytes());
                buf.put_slice(&response.proof);
                buf.put_u32(response.capabilities);
            }
            Message::Established(est) => {
                buf.put_slice(est.session_id.as_bytes());
                buf.put_u16(est.mtu);
                buf.put_u16(est.heartbeat_secs);
                buf.put_u32(est.rotation_secs);
                buf.put_u32(est.capabilities);
                match est.direct_endpoint {
                    None => buf.put_u8(0),
                    Some(addr) => {
                        buf.put_u8(1);
                        encode_endpoint(buf, addr);
                    }
                }
                match &est.direct_cert {
                    None => buf.put_u8(0),
                    Some(cert) => {
                        buf.put_u8(1);
                        buf.put_u16(cert.cert_der.len() as u16);
                        buf.put_slice(&cert.cert_der);
                        buf.put_slice(&cert.signature.to_bytes());
                    }
                }
            }
            Message::Data(frame) => {
                buf.put_slice(frame.session_id.as_bytes());
                buf.put_slice(&frame.nonce);
                buf.put_slice(&frame.ciphertext);
            }
            Message::Heartbeat | Message::HeartbeatAck => {}
            Message::Error(err) => {
                buf.put_u16(err.code);
                buf.put_slice(err.message.as_bytes());
            }
            Message::Close(close) => {
                buf.put_u16(close.code);
                buf.put_slice(close.reason.as_bytes());
            }
        }
    }

    /// Decode a payload of a known message type
    pub(crate) fn decode_payload(msg_type_code: u8, mut payload: Bytes) -> Result<Message> {
        match msg_type_code {
            msg_type::HELLO => {
                let client_id = take_node_id(&mut payload)?;
                let kem_public =
                    mlkem::PublicKey::from_bytes(take_vec(&mut payload, mlkem::PUBLIC_KEY_LEN)?)
                        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                let ecdh_public = take_array::<32>(&mut payload)?;
                let timestamp_ns = take_u64(&mut payload)?;
                let signature = take_signature(payload)?;

                Ok(Message::Hello(Hello {
                    client_id,
                    kem_public,
                    ecdh_public,
                    timestamp_ns,
                    signature,
                }))
            }
            msg_type::CHALLENGE => {
                let responder_id = take_node_id(&mut payload)?;
                let session_id = take_session_id(&mut payload)?;
                let kem_ciphertext =
                    mlkem::Ciphertext::from_bytes(take_vec(&mut payload, mlkem::CIPHERTEXT_LEN)?)
                        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                let ecdh_public = take_array::<32>(&mut payload)?;
                let nonce = take_array::<NONCE_LEN>(&mut payload)?;
                let timestamp_ns = take_u64(&mut payload)?;
                let signature = take_signature(payload)?;

                Ok(Message::Challenge(Box::new(Challenge {
                    responder_id,
                    session_id,
                    kem_ciphertext,
                    ecdh_public,
                    nonce,
                    timestamp_ns,
                    signature,
                })))
            }
            msg_type::RESPONSE => {
                let session_id = take_session_id(&mut payload)?;
                let proof = take_array::<32>(&mut payload)?;
                let capabilities = take_u32(&mut payload)?;
                expect_empty(&payload)?;

                Ok(Message::Response(Response {
                    session_id,
                    proof,
                    capabilities,
                }))
            }
            msg_type::ESTABLISHED => {
                let session_id = take_session_id(&mut payload)?;
                let mtu = take_u16(&mut payload)?;
                let heartbeat_secs = take_u16(&mut payload)?;
                let rotation_secs = take_u32(&mut payload)?;
                let capabilities = take_u32(&mut payload)?;

                let direct_endpoint = match take_u8(&mut payload)? {
                    0 => None,
                    1 => Some(decode_endpoint(&mut payload)?),
                    other => {
                        return Err(ProtocolError::Malformed(format!(
                            "invalid endpoint presence byte: {}",
                            other
                        )))
                    }
                };

                let direct_cert = match take_u8(&mut payload)? {
                    0 => {
                        expect_empty(&payload)?;
                        None
                    }
                    1 => {
                        let cert_len = take_u16(&mut payload)? as usize;
                        let cert_der = take_vec(&mut payload, cert_len)?;
                        let signature = take_signature(payload)?;
                        Some(DirectCert {
                            cert_der,
                            signature,
                        })
                    }
                    other => {
                        return Err(ProtocolError::Malformed(format!(
                            "invalid certificate presence byte: {}",
                            other
                        )))
                    }
                };

                Ok(Message::Established(Box::new(Established {
                    session_id,
                    mtu,
                    heartbeat_secs,
                    rotation_secs,
                    capabilities,
                    direct_endpoint,
                    direct_cert,
                })))
            }
            msg_type::DATA => {
                let session_id = take_session_id(&mut payload)?;
                let nonce = take_array::<12>(&mut payload)?;
                let ciphertext = payload.to_vec();

                // Ciphertext must at least hold the AEAD tag
                if ciphertext.len() < umbra_crypto::symmetric::TAG_LEN {
                    return Err(ProtocolError::Malformed(format!(
                        "DATA ciphertext shorter than tag: {}",
                        ciphertext.len()
                    )));
                }

                Ok(Message::Data(DataFrame {
                    session_id,
                    nonce,
                    ciphertext,
                }))
            }
            msg_type::HEARTBEAT => {
                expect_empty(&payload)?;
                Ok(Message::Heartbeat)
            }
            msg_type::HEARTBEAT_ACK => {
                expect_empty(&payload)?;
                Ok(Message::HeartbeatAck)
            }
            msg_type::ERROR => {
                let code = take_u16(&mut payload)?;
                let message = take_string(payload)?;
                Ok(Message::Error(ErrorMessage { code, message }))
            }
            msg_type::CLOSE => {
                let code = take_u16(&mut payload)?;
                let reason = take_string(payload)?;
                Ok(Message::Close(CloseMessage { code, reason }))
            }
            other => Err(ProtocolError::Malformed(format!(
                "unknown message type: {:#04x}",
                other
            ))),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Hello(h) => write!(f, "Hello(client={})", h.client_id),
            Message::Challenge(c) => write!(f, "Challenge(session={})", c.session_id),
            Message::Response(r) => write!(f, "Response(session={})", r.session_id),
            Message::Established(e) => write!(f, "Established(session={})", e.session_id),
            Message::Data(d) => write!(
                f,
                "Data(session={}, len={})",
                d.session_id,
                d.ciphertext.len()
            ),
            Message::Heartbeat => write!(f, "Heartbeat"),
            Message::HeartbeatAck => write!(f, "HeartbeatAck"),
            Message::Error(e) => write!(f, "Error(code={}, {:?})", e.code, e.message),
            Message::Close(c) => write!(f, "Close(code={}, {:?})", c.code, c.reason),
        }
    }
}

fn encode_endpoint(buf: &mut impl BufMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn decode_endpoint(payload: &mut Bytes) -> Result<SocketAddr> {
    let ip = match take_u8(payload)? {
        4 => IpAddr::V4(Ipv4Addr::from(take_array::<4>(payload)?)),
        6 => IpAddr::V6(Ipv6Addr::from(take_array::<16>(payload)?)),
        other => {
            return Err(ProtocolError::Malformed(format!(
                "invalid IP version: {}",
                other
            )))
        }
    };
    let port = take_u16(payload)?;
    Ok(SocketAddr::new(ip, port))
}

fn take_u8(payload: &mut Bytes) -> Result<u8> {
    if payload.remaining() < 1 {
        return Err(truncated());
    }
    Ok(payload.get_u8())
}

fn take_u16(payload: &mut Bytes) -> Result<u16> {
    if payload.remaining() < 2 {
        return Err(truncated());
    }
    Ok(payload.get_u16())
}

fn take_u32(payload: &mut Bytes) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(truncated());
    }
    Ok(payload.get_u32())
}

fn take_u64(payload: &mut Bytes) -> Result<u64> {
    if payload.remaining() < 8 {
        return Err(truncated());
    }
    Ok(payload.get_u64())
}

fn take_array<const N: usize>(payload: &mut Bytes) -> Result<[u8; N]> {
    if payload.remaining() < N {
        return Err(truncated());
    }
    let mut out = [0u8; N];
    payload.copy_to_slice(&mut out);
    Ok(out)
}

fn take_vec(payload: &mut Bytes, len: usize) -> Result<Vec<u8>> {
    if payload.remaining() < len {
        return Err(truncated());
    }
    let mut out = vec![0u8; len];
    payload.copy_to_slice(&mut out);
    Ok(out)
}

fn take_node_id(payload: &mut Bytes) -> Result<NodeId> {
    Ok(NodeId(take_array::<32>(payload)?))
}

fn take_session_id(payload: &mut Bytes) -> Result<SessionId> {
    Ok(SessionId(take_array::<SESSION_ID_LEN>(payload)?))
}

/// Consume the remainder of the payload as a hybrid signature
fn take_signature(payload: Bytes) -> Result<HybridSignature> {
    HybridSignature::from_bytes(&payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Consume the remainder of the payload as UTF-8
fn take_string(payload: Bytes) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| ProtocolError::Malformed("invalid UTF-8 in message text".to_string()))
}

fn expect_empty(payload: &Bytes) -> Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::Malformed(format!(
            "{} trailing bytes in payload",
            payload.len()
        )))
    }
}

fn truncated() -> ProtocolError {
    ProtocolError::Malformed("truncated payload".to_string())
}
