//! UDP framing for emulation mode.
//!
//! Every datagram exchanged between emulated nodes carries the destination
//! and source node addresses ahead of the packet bytes, so a receiver can
//! learn the sender's transport address and filter traffic not meant for it.
//!
//! | Field   | Size (bytes)             |
//! |---------|--------------------------|
//! | dest    | 1                        |
//! | src     | 1                        |
//! | packet  | up to `MAX_PACKET_SIZE`  |

use crate::{NodeAddr, PacketError, MAX_PACKET_SIZE};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 2;

/// Largest datagram an emulated node will send or accept.
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PACKET_SIZE;

/// A packet addressed for transport over UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination node.
    pub dest: NodeAddr,
    /// Sending node.
    pub src: NodeAddr,
    /// Packet bytes, opaque to the framing layer.
    pub packet: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(dest: NodeAddr, src: NodeAddr, packet: Vec<u8>) -> Self {
        Frame { dest, src, packet }
    }

    /// Encode to a datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.packet.len());
        buf.push(self.dest.0);
        buf.push(self.src.0);
        buf.extend_from_slice(&self.packet);
        buf
    }

    /// Decode a received datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() < FRAME_HEADER_SIZE {
            return Err(PacketError::Truncated {
                len: datagram.len(),
                need: FRAME_HEADER_SIZE,
            });
        }
        if datagram.len() > MAX_FRAME_SIZE {
            return Err(PacketError::TooLarge {
                size: datagram.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Frame {
            dest: NodeAddr(datagram[0]),
            src: NodeAddr(datagram[1]),
            packet: datagram[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_prefix() {
        let frame = Frame::new(NodeAddr::BROADCAST, NodeAddr(4), vec![9, 8, 7]);
        let bytes = frame.encode();
        assert_eq!(bytes, vec![255, 4, 9, 8, 7]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_rejects_runt_and_oversize() {
        assert!(Frame::decode(&[1]).is_err());
        assert!(Frame::decode(&vec![0; MAX_FRAME_SIZE + 1]).is_err());
        assert!(Frame::decode(&[1, 2]).unwrap().packet.is_empty());
    }
}
