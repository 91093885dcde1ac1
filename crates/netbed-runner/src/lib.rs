//! # netbed-runner
//!
//! Execution backends for protocol code written against [`Protocol`]:
//!
//! - [`Simulator`]: every node in one process on a virtual clock, links
//!   modelled by the [`Topology`](netbed_link::Topology)
//! - [`Emulator`]: one node per process exchanging real UDP datagrams, with
//!   neighbors and link profiles pushed by the neighbor directory
//! - [`DirectoryServer`]: the neighbor directory itself
//!
//! Both backends share the [`Manager`] execution context and the control
//! command grammar in [`command`].

pub mod command;
mod config;
pub mod directory;
pub mod emulator;
mod error;
pub mod manager;
pub mod pacing;
pub mod ping;
pub mod protocol;
pub mod simulator;

pub use command::{Command, CommandMode, CommandParser, CommandScript, CommandSink};
pub use config::{
    DirectoryConfig, EmulatorConfig, FileConfig, SimulatorConfig, DEFAULT_DIRECTORY_PORT,
    MAX_SIMULATED_NODES,
};
pub use directory::{DirectoryClient, DirectoryHandle, DirectoryMessage, DirectoryServer};
pub use emulator::Emulator;
pub use error::{
    CommandError, ConfigError, DirectoryError, EmulatorError, ManagerError, ScriptError,
};
pub use manager::Manager;
pub use ping::PingNode;
pub use protocol::{timer, NodeContext, Protocol, TimerFn};
pub use simulator::Simulator;

pub use netbed_common::{RunSummary, SimTime};
