//! One-sided link used to throttle real sends in emulation.

use netbed_common::{PacketCounters, SimTime};
use netbed_packet::MAX_PACKET_SIZE;
use rand::Rng;

use crate::link::{check_size, serialize, transmit};
use crate::{Admission, DropReason, LinkError, LinkProfile};

/// The outbound leg from this process to one neighbor.
///
/// Same admission, overflow and loss model as [`Link`](crate::Link), with a
/// single queue clock and no liveness flag.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalLink {
    profile: LinkProfile,
    next_send: SimTime,
}

impl PhysicalLink {
    pub fn new(profile: LinkProfile) -> Result<Self, LinkError> {
        profile.validate()?;
        Ok(PhysicalLink {
            profile,
            next_send: SimTime::ZERO,
        })
    }

    pub fn profile(&self) -> &LinkProfile {
        &self.profile
    }

    /// Replace the profile, keeping the queue clock.
    pub fn set_profile(&mut self, profile: LinkProfile) -> Result<(), LinkError> {
        profile.validate()?;
        self.profile = profile;
        Ok(())
    }

    pub fn next_send_time(&self) -> SimTime {
        self.next_send
    }

    /// Offer a `size`-byte packet at time `now`.
    pub fn schedule<R: Rng + ?Sized>(
        &mut self,
        size: usize,
        now: SimTime,
        rng: &mut R,
        counters: &mut PacketCounters,
    ) -> Result<Admission, LinkError> {
        check_size(size, MAX_PACKET_SIZE)?;
        let Some(finish) = serialize(&self.profile, &mut self.next_send, size, now) else {
            counters.record_dropped();
            return Ok(Admission::Dropped(DropReason::Overflow));
        };
        Ok(transmit(&self.profile, true, finish, rng, counters))
    }
}
