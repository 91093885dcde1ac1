//! # netbed-link
//!
//! Link-layer model for the netbed engine.
//!
//! ## Features
//!
//! - **Link profiles**: loss probability, propagation delay, bandwidth and
//!   buffering time for a link ([`LinkProfile`])
//! - **Admission and serialization**: per-endpoint send-queue clocks with a
//!   bounded buffer ([`Link`], [`PhysicalLink`])
//! - **Topology registry**: the set of links and failed nodes, answering
//!   "is there a usable link between A and B right now" ([`Topology`])
//!
//! ## Packet Admission
//!
//! Scheduling a packet of `size` bytes from one endpoint at time `now`:
//!
//! 1. The packet starts serializing at `max(now, next_send_time)`.
//! 2. Serialization takes `size * 1_000_000 / bandwidth` microseconds.
//! 3. If serialization would finish more than `buffer_time` after `now`, the
//!    packet is dropped and the queue clock is left untouched.
//! 4. Otherwise the queue clock advances to the finish time.
//! 5. A dead link or a loss draw loses the packet; bandwidth stays consumed.
//! 6. Otherwise the packet arrives at `finish + delay`.

mod error;
mod link;
mod physical;
mod profile;
mod topology;

pub use error::LinkError;
pub use link::{Admission, DropReason, Link};
pub use physical::PhysicalLink;
pub use profile::{
    LinkProfile, DEFAULT_BANDWIDTH, DEFAULT_BUFFER_TIME, DEFAULT_DELAY, DEFAULT_LOSS_RATE,
};
pub use topology::{LinkKey, Topology};
