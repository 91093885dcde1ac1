//! Execution context shared by the simulation and emulation backends.
//!
//! The [`Manager`] owns everything that does not depend on where time comes
//! from: the event queue, the packet counters, the RNG behind loss draws,
//! send validation, and the gated command script. Each backend supplies its
//! own clock and its own event action type `A`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use netbed_common::{EventQueue, PacketCounters, RunSummary, SimTime};
use netbed_link::{Admission, Link, PhysicalLink};
use netbed_metrics::{metric_defs, metrics};
use netbed_packet::{NodeAddr, Packet, MAX_PACKET_SIZE};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{error, trace};

use crate::command::CommandScript;
use crate::ManagerError;

/// Time-source-agnostic coordinator state.
pub struct Manager<A> {
    events: EventQueue<A>,
    counters: PacketCounters,
    rng: ChaCha8Rng,
    commands: Option<CommandScript>,
    exit_requested: bool,
}

impl<A> Manager<A> {
    /// Create a manager whose loss draws are seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Manager {
            events: EventQueue::new(),
            counters: PacketCounters::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            commands: None,
            exit_requested: false,
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Check a send request and count it as sent.
    ///
    /// The packet must decode, fit the size limit and carry a TTL above zero;
    /// the source must be a unicast address.
    pub fn validate_send(
        &mut self,
        from: NodeAddr,
        to: NodeAddr,
        packet: &[u8],
    ) -> Result<(), ManagerError> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(ManagerError::PacketTooLarge {
                size: packet.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        if from.is_broadcast() {
            return Err(ManagerError::InvalidAddress(from));
        }
        let decoded = Packet::decode(packet)?;
        if !decoded.is_valid_to_send() {
            return Err(ManagerError::TtlExpired);
        }
        trace!(%from, %to, size = packet.len(), "Send accepted");
        self.counters.record_sent();
        Ok(())
    }

    /// Offer a packet to a topology link using this manager's RNG and
    /// counters.
    pub fn admit(
        &mut self,
        link: &mut Link,
        src: NodeAddr,
        size: usize,
        now: SimTime,
    ) -> Result<Admission, ManagerError> {
        metrics::histogram!(metric_defs::PACKET_SIZE.name).record(size as f64);
        Ok(link.schedule(src, size, now, &mut self.rng, &mut self.counters)?)
    }

    /// Offer a packet to a physical link.
    pub fn admit_physical(
        &mut self,
        link: &mut PhysicalLink,
        size: usize,
        now: SimTime,
    ) -> Result<Admission, ManagerError> {
        metrics::histogram!(metric_defs::PACKET_SIZE.name).record(size as f64);
        Ok(link.schedule(size, now, &mut self.rng, &mut self.counters)?)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Schedule `action` at absolute time `at`. Times in the past are due
    /// immediately.
    pub fn add_timer_at(&mut self, at: SimTime, action: A) {
        self.events.schedule(at, action);
    }

    /// Schedule `action` `delay` after `now`.
    pub fn add_timer(&mut self, now: SimTime, delay: Duration, action: A) {
        self.add_timer_at(now + delay, action);
    }

    pub fn next_event_time(&self) -> Option<SimTime> {
        self.events.next_time()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Take the next event due at or before `now`.
    pub fn pop_due(&mut self, now: SimTime) -> Option<A> {
        let event = self.events.pop_due(now)?;
        metrics::counter!(metric_defs::EVENTS_FIRED.name).increment(1);
        Some(event.into_callback())
    }

    // ========================================================================
    // Command script
    // ========================================================================

    pub fn set_command_script(&mut self, script: CommandScript) {
        self.commands = Some(script);
    }

    /// Next command line, if the script's gate has passed and `now > 0`.
    pub fn next_command(&mut self, now: SimTime) -> Option<String> {
        let script = self.commands.as_mut()?;
        let line = script.next_due(now);
        if script.is_finished() && line.is_none() {
            self.commands = None;
        }
        line
    }

    pub fn defer_commands_until(&mut self, at: SimTime) {
        if let Some(script) = self.commands.as_mut() {
            script.defer_until(at);
        }
    }

    /// When the command script may release its next line, if it has one.
    pub fn command_gate(&self) -> Option<SimTime> {
        self.commands.as_ref().and_then(CommandScript::gate)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn counters(&self) -> &PacketCounters {
        &self.counters
    }

    pub fn summary(&self, elapsed: Duration) -> RunSummary {
        self.counters.summary(elapsed)
    }
}

/// Run one event callback, containing any panic so the loop and the
/// remaining events are unaffected. Returns `false` if the callback panicked.
pub(crate) fn run_guarded(what: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(callback = what, %message, "Exception while invoking event callback");
            metrics::counter!(metric_defs::CALLBACKS_FAILED.name).increment(1);
            false
        }
    }
}
