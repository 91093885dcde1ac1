//! Built-in ping protocol.
//!
//! The command `<dest> <text>` sends `<text>` to `dest` as a ping. A node
//! answers every ping with a reply carrying the same payload, and matches
//! replies against its outstanding pings. Pings unanswered for
//! [`PING_TIMEOUT`] are dropped by a recurring timer.

use std::time::Duration;

use netbed_common::SimTime;
use netbed_packet::{protocol, NodeAddr, Packet, MAX_TTL};
use tracing::{info, warn};

use crate::protocol::{timer, NodeContext, Protocol};

pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingPing {
    dest: NodeAddr,
    payload: Vec<u8>,
    sent: SimTime,
}

/// A node that only speaks ping.
#[derive(Debug)]
pub struct PingNode {
    addr: NodeAddr,
    pending: Vec<PendingPing>,
    replies: u64,
}

impl PingNode {
    pub fn new(addr: NodeAddr) -> Self {
        PingNode {
            addr,
            pending: Vec::new(),
            replies: 0,
        }
    }

    /// Pings sent and not yet answered or timed out.
    pub fn pending_pings(&self) -> usize {
        self.pending.len()
    }

    /// Replies matched against an outstanding ping.
    pub fn replies_received(&self) -> u64 {
        self.replies
    }

    fn send(
        &self,
        ctx: &mut dyn NodeContext<Self>,
        dest: NodeAddr,
        proto: u8,
        payload: Vec<u8>,
    ) -> bool {
        let packet = match Packet::new(dest, self.addr, MAX_TTL, proto, 0, payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(node = %self.addr, error = %e, "Cannot build packet");
                return false;
            }
        };
        match ctx.send(dest, &packet.encode()) {
            Ok(sent) => sent,
            Err(e) => {
                warn!(node = %self.addr, error = %e, "Send failed");
                false
            }
        }
    }

    fn schedule_timeout_sweep(ctx: &mut dyn NodeContext<Self>) {
        ctx.add_timer(PING_TIMEOUT, timer(|node: &mut PingNode, ctx| node.time_out_pings(ctx)));
    }

    fn time_out_pings(&mut self, ctx: &mut dyn NodeContext<Self>) {
        let now = ctx.now();
        let addr = self.addr;
        self.pending.retain(|ping| {
            let expired = ping.sent + PING_TIMEOUT < now;
            if expired {
                info!(
                    "Node {addr}: Timing out ping to {} with message: {}",
                    ping.dest,
                    String::from_utf8_lossy(&ping.payload)
                );
            }
            !expired
        });
        Self::schedule_timeout_sweep(ctx);
    }

    fn receive_ping(&mut self, ctx: &mut dyn NodeContext<Self>, packet: Packet) {
        info!(
            "Node {}: Received Ping from {} with message: {}",
            self.addr,
            packet.src,
            String::from_utf8_lossy(&packet.payload)
        );
        self.send(ctx, packet.src, protocol::PING_REPLY, packet.payload);
    }

    fn receive_ping_reply(&mut self, packet: Packet) {
        let text = String::from_utf8_lossy(&packet.payload);
        let matched = self
            .pending
            .iter()
            .position(|ping| ping.dest == packet.src && ping.payload == packet.payload);
        match matched {
            Some(index) => {
                self.pending.remove(index);
                self.replies += 1;
                info!("Node {}: Got Ping Reply from {}: {text}", self.addr, packet.src);
            }
            None => warn!("Node {}: Unexpected Ping Reply from {}: {text}", self.addr, packet.src),
        }
    }
}

impl Protocol for PingNode {
    fn start(&mut self, ctx: &mut dyn NodeContext<Self>) {
        self.addr = ctx.addr();
        info!("Node {}: started", self.addr);
        Self::schedule_timeout_sweep(ctx);
    }

    fn on_receive(&mut self, ctx: &mut dyn NodeContext<Self>, src: NodeAddr, bytes: &[u8]) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Node {}: Unable to unpack message received from {src}: {e}", self.addr);
                return;
            }
        };
        match packet.protocol {
            protocol::PING => self.receive_ping(ctx, packet),
            protocol::PING_REPLY => self.receive_ping_reply(packet),
            other => warn!("Node {}: Packet with unknown protocol received: {other}", self.addr),
        }
    }

    fn on_command(&mut self, ctx: &mut dyn NodeContext<Self>, command: &str) {
        let parsed = command
            .split_once(' ')
            .and_then(|(dest, text)| Some((dest.parse::<NodeAddr>().ok()?, text)));
        let Some((dest, text)) = parsed else {
            warn!("Node {}: Unrecognized command: {command}", self.addr);
            return;
        };
        let payload = text.as_bytes().to_vec();
        if self.send(ctx, dest, protocol::PING, payload.clone()) {
            self.pending.push(PendingPing {
                dest,
                payload,
                sent: ctx.now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Simulator, SimulatorConfig};

    fn simulator(num_nodes: usize) -> Simulator<PingNode> {
        let config = SimulatorConfig::new(num_nodes).with_timescale(0.0).with_seed(3);
        Simulator::new(config, PingNode::new).unwrap()
    }

    #[test]
    fn test_ping_round_trip() {
        let mut sim = simulator(2);
        sim.execute_command("edge 0 1");
        sim.start();
        sim.execute_command("0 1 hello");
        assert_eq!(sim.node(NodeAddr(0)).unwrap().pending_pings(), 1);

        sim.run_until(SimTime::from_millis(100));
        let pinger = sim.node(NodeAddr(0)).unwrap();
        assert_eq!(pinger.pending_pings(), 0);
        assert_eq!(pinger.replies_received(), 1);
    }

    #[test]
    fn test_unanswered_ping_times_out() {
        let mut sim = simulator(2);
        sim.start();
        // No link: the send fails and nothing is recorded
        sim.execute_command("0 1 hello");
        assert_eq!(sim.node(NodeAddr(0)).unwrap().pending_pings(), 0);

        sim.execute_command("edge 0 1");
        sim.execute_command("fail 1");
        sim.execute_command("0 1 hello");
        assert_eq!(sim.node(NodeAddr(0)).unwrap().pending_pings(), 0);

        sim.execute_command("restart 1");
        sim.execute_command("edge 0 1 lossRate 1.0");
        sim.execute_command("0 1 lost");
        assert_eq!(sim.node(NodeAddr(0)).unwrap().pending_pings(), 1);

        sim.run_until(SimTime::from_secs(25.0));
        assert_eq!(sim.node(NodeAddr(0)).unwrap().pending_pings(), 0);
        assert_eq!(sim.node(NodeAddr(0)).unwrap().replies_received(), 0);
    }

    #[test]
    fn test_malformed_command_is_ignored() {
        let mut sim = simulator(2);
        sim.execute_command("edge 0 1");
        sim.start();
        sim.execute_command("0 nodest");
        sim.execute_command("0 x y");
        assert_eq!(sim.node(NodeAddr(0)).unwrap().pending_pings(), 0);
        assert_eq!(sim.pending_events(), 2);
    }
}
