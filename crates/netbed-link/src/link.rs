//! Undirected links with per-endpoint send queues.

use std::time::Duration;

use netbed_common::{PacketCounters, SimTime};
use netbed_packet::{NodeAddr, MAX_PACKET_SIZE};
use rand::Rng;

use crate::{LinkError, LinkProfile};

/// Why a packet was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The send buffer would have exceeded its buffering time.
    Overflow,
    /// The packet was transmitted but lost (random loss or dead link).
    Lost,
}

impl DropReason {
    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Overflow => "overflow",
            DropReason::Lost => "lost",
        }
    }
}

/// Outcome of offering a packet to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The packet arrives at the far end at this time.
    Delivered(SimTime),
    /// The packet will never arrive.
    Dropped(DropReason),
}

impl Admission {
    /// Arrival time, if the packet was delivered.
    pub fn arrival(&self) -> Option<SimTime> {
        match self {
            Admission::Delivered(at) => Some(*at),
            Admission::Dropped(_) => None,
        }
    }
}

/// Admission and serialization against one send-queue clock.
///
/// Returns the serialization finish time, or `None` if the packet would
/// overflow the buffer. On overflow `next_send` is not touched.
pub(crate) fn serialize(
    profile: &LinkProfile,
    next_send: &mut SimTime,
    size: usize,
    now: SimTime,
) -> Option<SimTime> {
    let tail = now.max(*next_send);
    let finish = tail + Duration::from_micros(profile.serialization_micros(size));
    if finish - now > profile.buffer_time {
        return None;
    }
    *next_send = finish;
    Some(finish)
}

/// Loss draw for a packet that already consumed bandwidth.
pub(crate) fn transmit<R: Rng + ?Sized>(
    profile: &LinkProfile,
    live: bool,
    finish: SimTime,
    rng: &mut R,
    counters: &mut PacketCounters,
) -> Admission {
    if !live || rng.gen::<f64>() < profile.loss_rate {
        counters.record_lost();
        return Admission::Dropped(DropReason::Lost);
    }
    Admission::Delivered(finish + profile.delay)
}

pub(crate) fn check_size(size: usize, max: usize) -> Result<(), LinkError> {
    if size > max {
        return Err(LinkError::PacketTooLarge { size, max });
    }
    Ok(())
}

/// One undirected connection between two node addresses.
///
/// Each endpoint owns an independent serialization queue; a packet's queue is
/// chosen by its source endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    a: NodeAddr,
    b: NodeAddr,
    live: bool,
    profile: LinkProfile,
    next_send: [SimTime; 2],
    max_packet_size: usize,
}

impl Link {
    /// Create a live link with both queue clocks at zero.
    pub fn new(a: NodeAddr, b: NodeAddr, profile: LinkProfile) -> Result<Self, LinkError> {
        if a == b {
            return Err(LinkError::SelfLoop(a));
        }
        if a.is_broadcast() || b.is_broadcast() {
            return Err(LinkError::BroadcastEndpoint);
        }
        profile.validate()?;
        Ok(Link {
            a,
            b,
            live: true,
            profile,
            next_send: [SimTime::ZERO; 2],
            max_packet_size: MAX_PACKET_SIZE,
        })
    }

    /// Raise or lower the largest packet `schedule` accepts.
    ///
    /// Defaults to [`MAX_PACKET_SIZE`].
    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    /// Whether this link joins `x` and `y`, in either order.
    pub fn is_edge(&self, x: NodeAddr, y: NodeAddr) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }

    /// The two endpoints, in creation order.
    pub fn endpoints(&self) -> (NodeAddr, NodeAddr) {
        (self.a, self.b)
    }

    /// The endpoint opposite `addr`, if `addr` is an endpoint.
    pub fn other(&self, addr: NodeAddr) -> Option<NodeAddr> {
        if addr == self.a {
            Some(self.b)
        } else if addr == self.b {
            Some(self.a)
        } else {
            None
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    pub fn profile(&self) -> &LinkProfile {
        &self.profile
    }

    /// Replace the profile in place. Queue clocks are kept.
    pub fn set_profile(&mut self, profile: LinkProfile) -> Result<(), LinkError> {
        profile.validate()?;
        self.profile = profile;
        Ok(())
    }

    /// Current queue clock for packets sent by `src`.
    pub fn next_send_time(&self, src: NodeAddr) -> Option<SimTime> {
        self.endpoint_index(src).map(|i| self.next_send[i])
    }

    fn endpoint_index(&self, src: NodeAddr) -> Option<usize> {
        if src == self.a {
            Some(0)
        } else if src == self.b {
            Some(1)
        } else {
            None
        }
    }

    /// Offer a `size`-byte packet from `src` at time `now`.
    ///
    /// Overflow leaves the queue clock unchanged and counts a drop. A lost
    /// packet still advances the clock and counts a loss.
    pub fn schedule<R: Rng + ?Sized>(
        &mut self,
        src: NodeAddr,
        size: usize,
        now: SimTime,
        rng: &mut R,
        counters: &mut PacketCounters,
    ) -> Result<Admission, LinkError> {
        check_size(size, self.max_packet_size)?;
        let index = self.endpoint_index(src).ok_or(LinkError::NotAnEndpoint {
            src,
            a: self.a,
            b: self.b,
        })?;

        let Some(finish) = serialize(&self.profile, &mut self.next_send[index], size, now) else {
            counters.record_dropped();
            return Ok(Admission::Dropped(DropReason::Overflow));
        };
        Ok(transmit(&self.profile, self.live, finish, rng, counters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn addr(n: u8) -> NodeAddr {
        NodeAddr(n)
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    fn profile(bw: u64, delay_ms: u64, bt_ms: u64) -> LinkProfile {
        LinkProfile::default()
            .with_bandwidth(bw)
            .with_delay(Duration::from_millis(delay_ms))
            .with_buffer_time(Duration::from_millis(bt_ms))
    }

    #[test]
    fn test_new_rejects_bad_endpoints() {
        assert_eq!(
            Link::new(addr(1), addr(1), LinkProfile::default()),
            Err(LinkError::SelfLoop(addr(1)))
        );
        assert_eq!(
            Link::new(addr(1), NodeAddr::BROADCAST, LinkProfile::default()),
            Err(LinkError::BroadcastEndpoint)
        );
    }

    #[test]
    fn test_is_edge_undirected() {
        let link = Link::new(addr(3), addr(7), LinkProfile::default()).unwrap();
        assert!(link.is_edge(addr(3), addr(7)));
        assert!(link.is_edge(addr(7), addr(3)));
        assert!(!link.is_edge(addr(3), addr(4)));
        assert_eq!(link.other(addr(7)), Some(addr(3)));
        assert_eq!(link.other(addr(9)), None);
    }

    #[test]
    fn test_clock_advances_by_serialization_time() {
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 0, 100_000)).unwrap();
        let mut counters = PacketCounters::new();
        let mut rng = rng();

        let mut expected = 0;
        for size in [1usize, 10, 50, 128] {
            link.schedule(addr(0), size, SimTime::ZERO, &mut rng, &mut counters)
                .unwrap();
            expected += size as u64 * 1_000;
            assert_eq!(
                link.next_send_time(addr(0)),
                Some(SimTime::from_micros(expected))
            );
        }
        // The other direction has its own queue
        assert_eq!(link.next_send_time(addr(1)), Some(SimTime::ZERO));
    }

    #[test]
    fn test_idle_queue_starts_at_now() {
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 10, 1_000)).unwrap();
        let mut counters = PacketCounters::new();
        let now = SimTime::from_secs(5.0);
        let result = link
            .schedule(addr(0), 100, now, &mut rng(), &mut counters)
            .unwrap();
        assert_eq!(
            result,
            Admission::Delivered(SimTime::from_micros(5_000_000 + 100_000 + 10_000))
        );
    }

    #[test]
    fn test_overflow_leaves_clock_unchanged() {
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 1, 0)).unwrap();
        let mut counters = PacketCounters::new();
        let mut rng = rng();

        for _ in 0..3 {
            let result = link
                .schedule(addr(0), 10, SimTime::ZERO, &mut rng, &mut counters)
                .unwrap();
            assert_eq!(result, Admission::Dropped(DropReason::Overflow));
            assert_eq!(link.next_send_time(addr(0)), Some(SimTime::ZERO));
        }
        assert_eq!(counters.dropped(), 3);
        assert_eq!(counters.lost(), 0);
    }

    #[test]
    fn test_buffer_bound_is_inclusive() {
        // 100 bytes at 1000 B/s is exactly 100ms of serialization
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 0, 100)).unwrap();
        let mut counters = PacketCounters::new();
        let mut rng = rng();

        let first = link
            .schedule(addr(0), 100, SimTime::ZERO, &mut rng, &mut counters)
            .unwrap();
        assert_eq!(first, Admission::Delivered(SimTime::from_millis(100)));

        let second = link
            .schedule(addr(0), 1, SimTime::ZERO, &mut rng, &mut counters)
            .unwrap();
        assert_eq!(second, Admission::Dropped(DropReason::Overflow));
        assert_eq!(link.next_send_time(addr(0)), Some(SimTime::from_millis(100)));
    }

    #[test]
    fn test_loss_still_consumes_bandwidth() {
        let lossy = profile(1_000, 1, 10_000).with_loss_rate(1.0);
        let mut link = Link::new(addr(0), addr(1), lossy).unwrap();
        let mut counters = PacketCounters::new();
        let mut rng = rng();

        for i in 1..=4u64 {
            let result = link
                .schedule(addr(0), 100, SimTime::ZERO, &mut rng, &mut counters)
                .unwrap();
            assert_eq!(result, Admission::Dropped(DropReason::Lost));
            assert_eq!(
                link.next_send_time(addr(0)),
                Some(SimTime::from_millis(100 * i))
            );
        }
        assert_eq!(counters.lost(), 4);
        assert_eq!(counters.dropped(), 0);
    }

    #[test]
    fn test_dead_link_loses_packets() {
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 1, 1_000)).unwrap();
        link.set_live(false);
        let mut counters = PacketCounters::new();
        let result = link
            .schedule(addr(1), 10, SimTime::ZERO, &mut rng(), &mut counters)
            .unwrap();
        assert_eq!(result, Admission::Dropped(DropReason::Lost));
        assert_eq!(link.next_send_time(addr(1)), Some(SimTime::from_millis(10)));
    }

    #[test]
    fn test_two_packets_queue_behind_each_other() {
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 10, 1_000))
            .unwrap()
            .with_max_packet_size(1_000);
        let mut counters = PacketCounters::new();
        let mut rng = rng();

        let first = link
            .schedule(addr(0), 1_000, SimTime::ZERO, &mut rng, &mut counters)
            .unwrap();
        assert_eq!(first, Admission::Delivered(SimTime::from_micros(1_010_000)));

        // Queued behind the first; finishes 2s after now, past the 1s budget
        let second = link
            .schedule(addr(0), 1_000, SimTime::ZERO, &mut rng, &mut counters)
            .unwrap();
        assert_eq!(second, Admission::Dropped(DropReason::Overflow));

        // With a larger budget the second packet arrives a second later
        link.set_profile(profile(1_000, 10, 2_000)).unwrap();
        let second = link
            .schedule(addr(0), 1_000, SimTime::ZERO, &mut rng, &mut counters)
            .unwrap();
        assert_eq!(second, Admission::Delivered(SimTime::from_micros(2_010_000)));
    }

    #[test]
    fn test_queue_fills_to_buffer_time() {
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 10, 1_000)).unwrap();
        let mut counters = PacketCounters::new();
        let mut rng = rng();

        // 7 full-size packets fit in the one-second budget, the eighth does not
        let mut last = None;
        for _ in 0..7 {
            last = link
                .schedule(addr(0), 128, SimTime::ZERO, &mut rng, &mut counters)
                .unwrap()
                .arrival();
        }
        assert_eq!(last, Some(SimTime::from_micros(896_000 + 10_000)));
        let eighth = link
            .schedule(addr(0), 128, SimTime::ZERO, &mut rng, &mut counters)
            .unwrap();
        assert_eq!(eighth, Admission::Dropped(DropReason::Overflow));
    }

    #[test]
    fn test_caller_errors() {
        let mut link = Link::new(addr(0), addr(1), LinkProfile::default()).unwrap();
        let mut counters = PacketCounters::new();
        let mut rng = rng();

        assert_eq!(
            link.schedule(addr(2), 10, SimTime::ZERO, &mut rng, &mut counters),
            Err(LinkError::NotAnEndpoint {
                src: addr(2),
                a: addr(0),
                b: addr(1)
            })
        );
        assert_eq!(
            link.schedule(addr(0), MAX_PACKET_SIZE + 1, SimTime::ZERO, &mut rng, &mut counters),
            Err(LinkError::PacketTooLarge {
                size: MAX_PACKET_SIZE + 1,
                max: MAX_PACKET_SIZE
            })
        );
        assert_eq!(counters, PacketCounters::new());
    }

    #[test]
    fn test_profile_update_keeps_clocks() {
        let mut link = Link::new(addr(0), addr(1), profile(1_000, 1, 1_000)).unwrap();
        let mut counters = PacketCounters::new();
        link.schedule(addr(0), 50, SimTime::ZERO, &mut rng(), &mut counters)
            .unwrap();

        link.set_profile(profile(2_000, 5, 500)).unwrap();
        assert_eq!(link.next_send_time(addr(0)), Some(SimTime::from_millis(50)));
        assert_eq!(link.profile().bandwidth, 2_000);
        assert!(link.set_profile(profile(0, 1, 1)).is_err());
        assert_eq!(link.profile().bandwidth, 2_000);
    }
}
