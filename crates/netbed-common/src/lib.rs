//! Common types for netbed backends.
//!
//! - [`SimTime`]: a microsecond timestamp used for both virtual and real time
//! - [`EventQueue`]: time-ordered queue of scheduled callbacks with FIFO
//!   ordering among equal timestamps
//! - [`PacketCounters`] and [`RunSummary`]: the statistics reported at shutdown

mod counters;
mod event;
mod time;

pub use counters::{PacketCounters, RunSummary};
pub use event::{Event, EventQueue};
pub use time::SimTime;
