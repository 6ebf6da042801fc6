//! Handshake capability bitfield.
//!
//! Each peer announces the optional wire features it understands by writing
//! the capability preamble before mode negotiation:
//!
//! ```text
//! +-------------------------------------+------------+------------------+
//! | "<===[JENKINS REMOTING CAPACITY]===>" | length u16 | bitmask (LE u64) |
//! +-------------------------------------+------------+------------------+
//! ```
//!
//! Unknown bits are ignored so that newer peers can talk to older ones. A
//! peer that never sends the preamble is treated as having no capabilities.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};

/// ASCII magic announcing a capability payload.
pub const CAPABILITY_PREAMBLE: &[u8] = b"<===[JENKINS REMOTING CAPACITY]===>";

/// Upper bound on the length-prefixed capability payload.
///
/// The bitmask is a 64-bit value today; anything much larger is a corrupt
/// length field, not a future extension.
pub const MAX_CAPABILITY_PAYLOAD: usize = 256;

/// 64-bit feature flag set exchanged at handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capability(u64);

impl Capability {
    /// Requests and responses may reference per-call deserialization contexts.
    pub const MULTI_CONTEXT_RPC: u64 = 1 << 0;
    /// Pipe writes are flow-controlled by chunk/ack windows.
    pub const PIPE_THROTTLING: u64 = 1 << 1;
    /// Remote pipes acknowledge per-write and report dead sinks.
    pub const PROXY_WRITER_2_35: u64 = 1 << 2;
    /// Commands may span multiple length-prefixed chunks.
    pub const CHUNKING: u64 = 1 << 3;

    /// A capability with no features, assumed for peers that never announce.
    pub fn empty() -> Self {
        Self(0)
    }

    /// The full feature set this implementation supports.
    pub fn current() -> Self {
        Self(
            Self::MULTI_CONTEXT_RPC
                | Self::PIPE_THROTTLING
                | Self::PROXY_WRITER_2_35
                | Self::CHUNKING,
        )
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn supports_multi_context_rpc(&self) -> bool {
        self.0 & Self::MULTI_CONTEXT_RPC != 0
    }

    pub fn supports_pipe_throttling(&self) -> bool {
        self.0 & Self::PIPE_THROTTLING != 0
    }

    pub fn supports_proxy_writer(&self) -> bool {
        self.0 & Self::PROXY_WRITER_2_35 != 0
    }

    pub fn supports_chunking(&self) -> bool {
        self.0 & Self::CHUNKING != 0
    }

    /// Clears the chunking bit; used to force the classic transport.
    pub fn without_chunking(mut self) -> Self {
        self.0 &= !Self::CHUNKING;
        self
    }

    /// Encodes the preamble: magic, 2-byte big-endian length, LE bitmask.
    pub fn write_preamble(&self, buf: &mut BytesMut) {
        buf.put_slice(CAPABILITY_PREAMBLE);
        buf.put_u16(8);
        buf.put_u64_le(self.0);
    }

    /// Decodes the length-prefixed payload that follows the magic.
    ///
    /// Shorter payloads are zero-extended and longer ones keep only their
    /// first eight bytes, so both older and newer peers parse cleanly.
    pub fn parse_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_CAPABILITY_PAYLOAD {
            return Err(ProtocolError::CapabilityTooLarge(payload.len()));
        }
        let mut bits = [0u8; 8];
        let n = payload.len().min(8);
        bits[..n].copy_from_slice(&payload[..n]);
        Ok(Self(u64::from_le_bytes(bits)))
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capability[0x{:x}]", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_supports_everything() {
        let cap = Capability::current();
        assert!(cap.supports_multi_context_rpc());
        assert!(cap.supports_pipe_throttling());
        assert!(cap.supports_proxy_writer());
        assert!(cap.supports_chunking());
    }

    #[test]
    fn test_empty_supports_nothing() {
        let cap = Capability::empty();
        assert!(!cap.supports_pipe_throttling());
        assert!(!cap.supports_chunking());
    }

    #[test]
    fn test_preamble_layout() {
        let mut buf = BytesMut::new();
        Capability::current().write_preamble(&mut buf);

        assert!(buf.starts_with(CAPABILITY_PREAMBLE));
        let rest = &buf[CAPABILITY_PREAMBLE.len()..];
        assert_eq!(u16::from_be_bytes([rest[0], rest[1]]), 8);
        assert_eq!(
            u64::from_le_bytes(rest[2..10].try_into().unwrap()),
            Capability::current().bits()
        );
    }

    #[test]
    fn test_parse_payload_roundtrip() {
        let cap = Capability::current();
        let payload = cap.bits().to_le_bytes();
        let parsed = Capability::parse_payload(&payload).unwrap();
        assert_eq!(parsed, cap);
    }

    #[test]
    fn test_parse_short_payload_zero_extends() {
        let parsed = Capability::parse_payload(&[0x0b]).unwrap();
        assert_eq!(parsed.bits(), 0x0b);
    }

    #[test]
    fn test_parse_long_payload_ignores_unknown_tail() {
        let mut payload = vec![0u8; 16];
        payload[0] = 0x08;
        payload[15] = 0xff;
        let parsed = Capability::parse_payload(&payload).unwrap();
        assert!(parsed.supports_chunking());
        assert_eq!(parsed.bits(), 0x08);
    }

    #[test]
    fn test_parse_oversize_payload_rejected() {
        let payload = vec![0u8; MAX_CAPABILITY_PAYLOAD + 1];
        assert!(matches!(
            Capability::parse_payload(&payload),
            Err(ProtocolError::CapabilityTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_bits_are_preserved_but_unrecognized() {
        let cap = Capability::from_bits(1 << 40 | Capability::PIPE_THROTTLING);
        assert!(cap.supports_pipe_throttling());
        assert!(!cap.supports_chunking());
        assert_eq!(cap.bits() >> 40, 1);
    }

    #[test]
    fn test_without_chunking() {
        let cap = Capability::current().without_chunking();
        assert!(!cap.supports_chunking());
        assert!(cap.supports_pipe_throttling());
    }
}
