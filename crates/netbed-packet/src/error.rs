//! Error types for netbed-packet.

use thiserror::Error;

/// Errors that can occur during packet operations.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Invalid packet format.
    #[error("Invalid packet format: {0}")]
    InvalidFormat(String),

    /// Buffer ended before the header was complete.
    #[error("Truncated packet: {len} bytes (need at least {need})")]
    Truncated {
        /// Bytes available.
        len: usize,
        /// Bytes required.
        need: usize,
    },

    /// Packet too large.
    #[error("Packet too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The length byte disagrees with the buffer length.
    #[error("Length mismatch: header says {declared}, buffer has {actual}")]
    LengthMismatch {
        /// Length declared in the header.
        declared: usize,
        /// Actual buffer length.
        actual: usize,
    },

    /// TTL outside `0..=MAX_TTL`.
    #[error("Invalid TTL: {0}")]
    InvalidTtl(u8),

    /// Address outside `0..=255`.
    #[error("Invalid address: {0}")]
    InvalidAddress(i64),
}

impl PacketError {
    /// Create an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        PacketError::InvalidFormat(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PacketError::Truncated { len: 3, need: 9 };
        assert!(err.to_string().contains("3 bytes"));

        let err = PacketError::invalid_format("missing header");
        assert!(err.to_string().contains("missing header"));
    }
}
