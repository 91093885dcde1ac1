//! Error types for netbed-link.

use netbed_packet::NodeAddr;
use thiserror::Error;

/// Caller errors raised by link operations.
///
/// Dropped and lost packets are not errors; they are reported as
/// [`Admission::Dropped`](crate::Admission::Dropped).
#[derive(Debug, Error, PartialEq)]
pub enum LinkError {
    /// Loss rate outside `[0, 1]`.
    #[error("Invalid loss rate {0} (must be within 0..=1)")]
    InvalidLossRate(f64),

    /// Bandwidth must be positive.
    #[error("Bandwidth must be greater than zero")]
    ZeroBandwidth,

    /// A link needs two distinct endpoints.
    #[error("Link endpoints must differ (both are {0})")]
    SelfLoop(NodeAddr),

    /// The broadcast address cannot terminate a link.
    #[error("Broadcast address cannot be a link endpoint")]
    BroadcastEndpoint,

    /// The source given to `schedule` is not an endpoint of the link.
    #[error("Node {src} is not an endpoint of link {a}-{b}")]
    NotAnEndpoint {
        /// Requested source.
        src: NodeAddr,
        /// First endpoint.
        a: NodeAddr,
        /// Second endpoint.
        b: NodeAddr,
    },

    /// Packet larger than the maximum packet size.
    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Offered size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}
