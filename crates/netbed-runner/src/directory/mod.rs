//! Neighbor directory.
//!
//! Emulated nodes register with the directory over TCP: the node writes its
//! UDP port as one line and reads back its assigned address (255 on a port
//! conflict). The connection then stays open and the directory pushes
//! [`DirectoryMessage`] lines whenever the node's neighbor set changes.

mod client;
mod protocol;
mod server;

pub use client::DirectoryClient;
pub use protocol::DirectoryMessage;
pub use server::{DirectoryHandle, DirectoryServer, DirectoryState, Rejection};
