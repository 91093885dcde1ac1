//! Packet header encoding and decoding.
//!
//! ## Packet Format
//!
//! | Field    | Size (bytes) | Description                                  |
//! |----------|--------------|----------------------------------------------|
//! | dest     | 1            | Destination address (255 = broadcast).       |
//! | src      | 1            | Source address.                              |
//! | ttl      | 1            | Remaining hop count, `0..=MAX_TTL`.          |
//! | protocol | 1            | Protocol number, opaque to the engine.       |
//! | length   | 1            | Total packet length including this header.   |
//! | seq      | 4            | Sequence number, big-endian.                 |
//! | payload  | up to 119    | Protocol data (`MAX_PAYLOAD_SIZE`).          |

use bytes::{Buf, BufMut};

use crate::{NodeAddr, PacketError, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, MAX_TTL};

/// Well-known protocol numbers.
pub mod protocol {
    /// Ping request.
    pub const PING: u8 = 0;
    /// Ping reply.
    pub const PING_REPLY: u8 = 1;
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Destination address.
    pub dest: NodeAddr,
    /// Source address.
    pub src: NodeAddr,
    /// Remaining hop count.
    pub ttl: u8,
    /// Protocol number.
    pub protocol: u8,
    /// Sequence number.
    pub seq: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, checking TTL and payload size.
    pub fn new(
        dest: NodeAddr,
        src: NodeAddr,
        ttl: u8,
        protocol: u8,
        seq: u32,
        payload: Vec<u8>,
    ) -> Result<Self, PacketError> {
        if ttl > MAX_TTL {
            return Err(PacketError::InvalidTtl(ttl));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::TooLarge {
                size: payload.len() + HEADER_SIZE,
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(Packet {
            dest,
            src,
            ttl,
            protocol,
            seq,
            payload,
        })
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// A packet may sit in a queue with TTL 0, but it may not be sent.
    pub fn is_valid_to_send(&self) -> bool {
        self.ttl > 0 && self.ttl <= MAX_TTL && self.len() <= MAX_PACKET_SIZE
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        buf.put_u8(self.dest.0);
        buf.put_u8(self.src.0);
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol);
        buf.put_u8(self.len() as u8);
        buf.put_u32(self.seq);
        buf.put_slice(&self.payload);
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::Truncated {
                len: bytes.len(),
                need: HEADER_SIZE,
            });
        }
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge {
                size: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let mut buf = bytes;
        let dest = NodeAddr(buf.get_u8());
        let src = NodeAddr(buf.get_u8());
        let ttl = buf.get_u8();
        let protocol = buf.get_u8();
        let declared = buf.get_u8() as usize;
        let seq = buf.get_u32();

        if declared != bytes.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        Packet::new(dest, src, ttl, protocol, seq, buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(NodeAddr(3), NodeAddr(1), 15, protocol::PING, 0x0102_0304, b"hi".to_vec())
            .unwrap();
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(&bytes[..9], &[3, 1, 15, 0, 11, 1, 2, 3, 4]);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = Packet::new(NodeAddr(0), NodeAddr(1), 1, 0, 0, vec![7; 4])
            .unwrap()
            .encode();
        bytes.push(0);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::LengthMismatch { declared: 13, actual: 14 })
        ));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            Packet::decode(&[1, 2, 3]),
            Err(PacketError::Truncated { len: 3, need: 9 })
        ));
    }

    #[test]
    fn test_zero_ttl_not_sendable() {
        let packet = Packet::new(NodeAddr(0), NodeAddr(1), 0, 0, 0, Vec::new()).unwrap();
        assert!(!packet.is_valid_to_send());
        let packet = Packet { ttl: 1, ..packet };
        assert!(packet.is_valid_to_send());
    }

    #[test]
    fn test_payload_limit() {
        assert!(Packet::new(NodeAddr(0), NodeAddr(1), 1, 0, 0, vec![0; MAX_PAYLOAD_SIZE]).is_ok());
        assert!(matches!(
            Packet::new(NodeAddr(0), NodeAddr(1), 1, 0, 0, vec![0; MAX_PAYLOAD_SIZE + 1]),
            Err(PacketError::TooLarge { .. })
        ));
        assert!(matches!(
            Packet::new(NodeAddr(0), NodeAddr(1), MAX_TTL + 1, 0, 0, Vec::new()),
            Err(PacketError::InvalidTtl(16))
        ));
    }
}
