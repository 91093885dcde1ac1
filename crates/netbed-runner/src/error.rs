//! Error types for the netbed backends.

use std::io;
use std::path::PathBuf;

use netbed_link::LinkError;
use netbed_packet::{NodeAddr, PacketError};
use thiserror::Error;

/// Caller errors from the execution context.
///
/// These are returned to protocol code synchronously. Buffer overflow and
/// transmission loss are not errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The bytes handed to `send` are not a sendable packet.
    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    /// TTL of zero.
    #[error("Packet TTL is zero; it may not be sent")]
    TtlExpired,

    /// Address outside the valid range for this position.
    #[error("Invalid address {0}")]
    InvalidAddress(NodeAddr),

    /// Packet larger than the maximum packet size.
    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Offered size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Link model rejected the call.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Errors parsing a control command line.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Error parsing {command} command: {line}")]
    Syntax {
        /// Command keyword.
        command: &'static str,
        /// Offending line.
        line: String,
    },

    #[error("Unrecognized command: {0}")]
    Unrecognized(String),

    #[error("Invalid link options: {0}")]
    Link(#[from] LinkError),
}

impl CommandError {
    pub(crate) fn syntax(command: &'static str, line: &str) -> Self {
        CommandError::Syntax {
            command,
            line: line.to_string(),
        }
    }
}

/// Errors reading a command or topology script.
#[derive(Debug, Error)]
#[error("Failed to read script {path}: {source}")]
pub struct ScriptError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Fatal emulation startup faults and runtime I/O faults.
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// The directory answered the registration with the broadcast address.
    #[error("Port {0} is already in use. Pick another")]
    PortConflict(u16),

    /// The local UDP socket could not be bound.
    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The directory connection or registration failed.
    #[error("Directory handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Directory wire protocol and server errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The listener could not be bound.
    #[error("Failed to bind directory port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A line that is not a directory message.
    #[error("Unrecognized command from directory: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid number of nodes to simulate: {0} (must be 1..=254)")]
    NodeCount(usize),

    #[error("Timescale must be non-negative, got {0}")]
    Timescale(f64),

    #[error("Invalid default link profile: {0}")]
    Link(#[from] LinkError),
}
