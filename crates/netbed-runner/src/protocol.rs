//! The interface between protocol code and a backend.
//!
//! Protocol code is written once against [`Protocol`] and [`NodeContext`] and
//! runs unchanged under the [`Simulator`](crate::Simulator) (many nodes, one
//! process, virtual clock) or the [`Emulator`](crate::Emulator) (one node per
//! process, wall clock, real UDP).

use std::time::Duration;

use netbed_common::SimTime;
use netbed_packet::NodeAddr;

use crate::ManagerError;

/// A timer callback, captured when the timer is scheduled.
pub type TimerFn<P> = Box<dyn FnOnce(&mut P, &mut dyn NodeContext<P>)>;

/// What a node can ask of the backend it runs on.
pub trait NodeContext<P> {
    /// This node's address.
    fn addr(&self) -> NodeAddr;

    /// Current time: virtual in simulation, time since start in emulation.
    fn now(&self) -> SimTime;

    /// Send an encoded packet to `to` (or [`NodeAddr::BROADCAST`]).
    ///
    /// Returns `Ok(false)` when there is no usable path to `to`. A packet that
    /// is dropped or lost on the link still counts as sent. Invalid packets
    /// and addresses are errors.
    fn send(&mut self, to: NodeAddr, packet: &[u8]) -> Result<bool, ManagerError>;

    /// Fire `callback` at absolute time `at`. Times in the past fire on the
    /// next tick.
    fn add_timer_at(&mut self, at: SimTime, callback: TimerFn<P>);

    /// Fire `callback` after `delay`.
    fn add_timer(&mut self, delay: Duration, callback: TimerFn<P>) {
        let at = self.now() + delay;
        self.add_timer_at(at, callback);
    }
}

/// Per-node protocol logic.
pub trait Protocol: Sized + 'static {
    /// Called once before the backend's main loop starts.
    fn start(&mut self, ctx: &mut dyn NodeContext<Self>);

    /// A packet from `src` arrived.
    fn on_receive(&mut self, ctx: &mut dyn NodeContext<Self>, src: NodeAddr, packet: &[u8]);

    /// A control-command message addressed to this node.
    fn on_command(&mut self, ctx: &mut dyn NodeContext<Self>, command: &str);
}

/// Box a timer closure.
pub fn timer<P, F>(callback: F) -> TimerFn<P>
where
    F: FnOnce(&mut P, &mut dyn NodeContext<P>) + 'static,
{
    Box::new(callback)
}
