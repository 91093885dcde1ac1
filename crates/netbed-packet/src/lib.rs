//! # netbed-packet
//!
//! Addressing and byte layouts shared by every netbed backend.
//!
//! The engine itself treats packets as opaque byte buffers: the only things it
//! needs from a packet are its length (for bandwidth accounting) and its TTL
//! (a packet with TTL 0 may not be sent). This crate provides:
//!
//! - [`NodeAddr`]: an integer node address in `0..=254`, with `255` reserved
//!   for broadcast
//! - [`Packet`]: the 9-byte header codec used by protocol code
//! - [`Frame`]: the envelope used to carry a packet over a real UDP socket
//!   in emulation mode

mod codec;
mod error;
mod frame;

pub use codec::*;
pub use error::*;
pub use frame::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest unicast node address.
pub const MAX_NODE_ADDRESS: u8 = 254;

/// Address reserved for broadcast.
pub const BROADCAST_ADDRESS: u8 = 255;

/// Largest packet (header + payload) the engine will carry, in bytes.
pub const MAX_PACKET_SIZE: usize = 128;

/// Packet header size in bytes.
pub const HEADER_SIZE: usize = 9;

/// Largest payload that fits in a packet.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Maximum hop count.
pub const MAX_TTL: u8 = 15;

/// A node address.
///
/// Addresses are plain integers; they index into registry structures rather
/// than naming allocated objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub u8);

impl NodeAddr {
    /// The broadcast address.
    pub const BROADCAST: NodeAddr = NodeAddr(BROADCAST_ADDRESS);

    /// Create a unicast address. Returns `None` for the broadcast address.
    pub fn unicast(addr: u8) -> Option<Self> {
        if addr <= MAX_NODE_ADDRESS {
            Some(NodeAddr(addr))
        } else {
            None
        }
    }

    /// Whether this is the broadcast address.
    pub fn is_broadcast(self) -> bool {
        self.0 == BROADCAST_ADDRESS
    }

    /// The address as an index into per-node tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for NodeAddr {
    fn from(addr: u8) -> Self {
        NodeAddr(addr)
    }
}

impl FromStr for NodeAddr {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .parse()
            .map_err(|_| PacketError::invalid_format(format!("not an address: {s}")))?;
        if !(0..=BROADCAST_ADDRESS as i64).contains(&value) {
            return Err(PacketError::InvalidAddress(value));
        }
        Ok(NodeAddr(value as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicast_rejects_broadcast() {
        assert_eq!(NodeAddr::unicast(254), Some(NodeAddr(254)));
        assert_eq!(NodeAddr::unicast(255), None);
        assert!(NodeAddr::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!("17".parse::<NodeAddr>().unwrap(), NodeAddr(17));
        assert_eq!("255".parse::<NodeAddr>().unwrap(), NodeAddr::BROADCAST);
        assert!(matches!(
            "256".parse::<NodeAddr>(),
            Err(PacketError::InvalidAddress(256))
        ));
        assert!("-1".parse::<NodeAddr>().is_err());
        assert!("abc".parse::<NodeAddr>().is_err());
    }
}
