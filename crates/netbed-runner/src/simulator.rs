//! Discrete-event simulation of many nodes in one process.
//!
//! All nodes share one virtual clock. The main loop jumps the clock from
//! event to event; while waiting for keyboard input it is paced against the
//! wall clock by the configured timescale (see [`Pacer`]).
//!
//! Everything runs on the caller's thread. Keyboard input arrives through a
//! channel fed by a reader thread that only enqueues lines.

use std::time::Instant;

use crossbeam_channel::{after, never, select, Receiver, TryRecvError};
use netbed_common::{RunSummary, SimTime};
use netbed_link::{Admission, LinkProfile, Topology};
use netbed_metrics::{metric_defs, metrics};
use netbed_packet::NodeAddr;
use tracing::{debug, info, trace, warn};

use crate::command::{execute_line, CommandMode, CommandParser, CommandScript, CommandSink};
use crate::manager::{run_guarded, Manager};
use crate::pacing::{Pacer, Wait};
use crate::protocol::{NodeContext, Protocol, TimerFn};
use crate::{ConfigError, ManagerError, SimulatorConfig};

/// Virtual time at which nodes start. Commands are never applied at zero.
const START_TIME: SimTime = SimTime::from_micros(1);

/// Scheduled work in the simulator.
enum SimAction<P> {
    /// A packet arrives at `dest`.
    Deliver {
        dest: NodeAddr,
        src: NodeAddr,
        packet: Vec<u8>,
    },
    /// A node's timer fires.
    Timer { node: NodeAddr, callback: TimerFn<P> },
    /// The topology script's time gate passed.
    ResumeTopology,
}

/// State reachable from inside node callbacks.
struct SimCore<P> {
    manager: Manager<SimAction<P>>,
    topology: Topology,
    now: SimTime,
    num_nodes: usize,
}

impl<P> SimCore<P> {
    fn send(&mut self, from: NodeAddr, to: NodeAddr, packet: &[u8]) -> Result<bool, ManagerError> {
        self.manager.validate_send(from, to, packet)?;

        if to.is_broadcast() {
            for index in 0..self.num_nodes {
                self.transmit(from, NodeAddr(index as u8), packet)?;
            }
            return Ok(true);
        }
        if self.transmit(from, to, packet)? {
            Ok(true)
        } else {
            warn!(%from, %to, "Failed to send packet: no live link");
            Ok(false)
        }
    }

    /// Offer one copy of a packet to the link from `from` to `to`. Returns
    /// `false` if there is no usable link.
    fn transmit(&mut self, from: NodeAddr, to: NodeAddr, packet: &[u8]) -> Result<bool, ManagerError> {
        if to.index() >= self.num_nodes {
            return Ok(false);
        }
        let Some(link) = self.topology.get_live_link(from, to) else {
            return Ok(false);
        };
        match self.manager.admit(link, from, packet.len(), self.now)? {
            Admission::Delivered(at) => {
                trace!(src = %from, dest = %to, at_us = at.as_micros(), "Packet scheduled");
                self.manager.add_timer_at(
                    at,
                    SimAction::Deliver {
                        dest: to,
                        src: from,
                        packet: packet.to_vec(),
                    },
                );
            }
            Admission::Dropped(reason) => {
                trace!(src = %from, dest = %to, reason = reason.as_str(), "Packet not delivered");
            }
        }
        Ok(true)
    }
}

/// The view of the simulator a node sees while one of its callbacks runs.
struct SimContext<'a, P> {
    core: &'a mut SimCore<P>,
    addr: NodeAddr,
}

impl<P> NodeContext<P> for SimContext<'_, P> {
    fn addr(&self) -> NodeAddr {
        self.addr
    }

    fn now(&self) -> SimTime {
        self.core.now
    }

    fn send(&mut self, to: NodeAddr, packet: &[u8]) -> Result<bool, ManagerError> {
        self.core.send(self.addr, to, packet)
    }

    fn add_timer_at(&mut self, at: SimTime, callback: TimerFn<P>) {
        self.core.manager.add_timer_at(
            at,
            SimAction::Timer {
                node: self.addr,
                callback,
            },
        );
    }
}

/// Simulation backend.
pub struct Simulator<P> {
    nodes: Vec<P>,
    core: SimCore<P>,
    parser: CommandParser,
    topology_script: Option<CommandScript>,
    pacer: Pacer,
    started: bool,
}

impl<P: Protocol> Simulator<P> {
    /// Create a simulator with nodes `0..config.num_nodes`, each built by
    /// `factory`.
    pub fn new(
        config: SimulatorConfig,
        mut factory: impl FnMut(NodeAddr) -> P,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let topology = if config.all_to_all {
            Topology::all_to_all()
        } else {
            Topology::new()
        }
        .with_default_profile(config.default_profile);

        let nodes = (0..config.num_nodes)
            .map(|index| factory(NodeAddr(index as u8)))
            .collect();

        info!(
            nodes = config.num_nodes,
            timescale = config.timescale,
            seed = config.seed,
            "Simulator created"
        );

        Ok(Simulator {
            nodes,
            core: SimCore {
                manager: Manager::new(config.seed),
                topology,
                now: SimTime::ZERO,
                num_nodes: config.num_nodes,
            },
            parser: CommandParser::new(CommandMode::Simulation)
                .with_default_profile(config.default_profile),
            topology_script: None,
            pacer: Pacer::new(config.timescale),
            started: false,
        })
    }

    /// Apply a topology script up to its first `time` gate. The rest is
    /// applied as the clock reaches each gate.
    pub fn load_topology(&mut self, script: CommandScript) {
        self.topology_script = Some(script);
        self.resume_topology();
    }

    /// Feed a command script one line per loop iteration once the clock is
    /// past zero.
    pub fn set_command_script(&mut self, script: CommandScript) {
        self.core.manager.set_command_script(script);
    }

    /// Start every node and move the clock past zero. Called by the run
    /// methods if not called before.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for (index, node) in self.nodes.iter_mut().enumerate() {
            let mut ctx = SimContext {
                core: &mut self.core,
                addr: NodeAddr(index as u8),
            };
            node.start(&mut ctx);
        }
        self.core.now = self.core.now.max(START_TIME);
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run until `exit`, or until `input` is closed with nothing left to do.
    pub fn run(&mut self, input: Receiver<String>) -> RunSummary {
        self.start();
        let mut input = input;
        let mut input_open = true;

        while !self.core.manager.exit_requested() {
            self.feed_command_script();
            if self.core.manager.exit_requested() {
                break;
            }

            let next = self.next_wakeup();
            let gap = next.map(|at| at.saturating_duration_since(self.core.now));
            let wait = self.pacer.wait_for(gap);
            if wait == Wait::Forever && !input_open {
                debug!("Input closed and nothing scheduled");
                break;
            }

            let waited_from = Instant::now();
            match wait_for_input(&input, wait) {
                Input::Line(line) => {
                    self.core.now += self.pacer.virtual_elapsed(waited_from.elapsed());
                    self.execute_command(&line);
                }
                Input::Closed => {
                    input = never();
                    input_open = false;
                }
                Input::Timeout => {
                    if let Some(at) = next {
                        self.core.now = self.core.now.max(at);
                    }
                    self.fire_due_events();
                }
            }
        }

        self.summary()
    }

    /// Process everything scheduled at or before `limit`, then leave the
    /// clock at `limit`. Ignores the timescale.
    pub fn run_until(&mut self, limit: SimTime) {
        self.run_virtual(limit);
        self.core.now = self.core.now.max(limit);
    }

    /// Process events until nothing is scheduled or `exit` is requested.
    pub fn run_until_idle(&mut self) {
        self.run_virtual(SimTime::MAX);
    }

    fn run_virtual(&mut self, limit: SimTime) {
        self.start();
        while !self.core.manager.exit_requested() {
            self.feed_command_script();
            match self.next_wakeup() {
                Some(at) if at <= limit => {
                    self.core.now = self.core.now.max(at);
                    self.fire_due_events();
                }
                _ => break,
            }
        }
    }

    fn next_wakeup(&self) -> Option<SimTime> {
        let events = self.core.manager.next_event_time();
        let commands = self.core.manager.command_gate();
        match (events, commands) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn feed_command_script(&mut self) {
        let now = self.core.now;
        if let Some(line) = self.core.manager.next_command(now) {
            let parser = self.parser.clone();
            if let Some(gate) = execute_line(self, &parser, &line, now) {
                self.core.manager.defer_commands_until(gate);
            }
        }
    }

    fn fire_due_events(&mut self) {
        while let Some(action) = self.core.manager.pop_due(self.core.now) {
            self.dispatch(action);
        }
        metrics::gauge!(metric_defs::EVENT_QUEUE_DEPTH.name)
            .set(self.core.manager.pending_events() as f64);
    }

    fn dispatch(&mut self, action: SimAction<P>) {
        match action {
            SimAction::Deliver { dest, src, packet } => {
                let Some(node) = self.nodes.get_mut(dest.index()) else {
                    return;
                };
                metrics::counter!(metric_defs::PACKETS_DELIVERED.name, "node" => dest.to_string())
                    .increment(1);
                let mut ctx = SimContext {
                    core: &mut self.core,
                    addr: dest,
                };
                run_guarded("on_receive", || node.on_receive(&mut ctx, src, &packet));
            }
            SimAction::Timer { node: addr, callback } => {
                let Some(node) = self.nodes.get_mut(addr.index()) else {
                    return;
                };
                let mut ctx = SimContext {
                    core: &mut self.core,
                    addr,
                };
                run_guarded("timer", || callback(node, &mut ctx));
            }
            SimAction::ResumeTopology => self.resume_topology(),
        }
    }

    fn resume_topology(&mut self) {
        let Some(mut script) = self.topology_script.take() else {
            return;
        };
        let parser = self.parser.clone();
        let now = self.core.now;
        if let Some(gate) = script.run_until_gate(&parser, self, now) {
            debug!(gate = %gate, "Topology deferred");
            self.core.manager.add_timer_at(gate, SimAction::ResumeTopology);
            self.topology_script = Some(script);
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Parse and apply one command line as if it were typed at the console.
    pub fn execute_command(&mut self, line: &str) {
        let parser = self.parser.clone();
        let now = self.core.now;
        if execute_line(self, &parser, line, now).is_some() {
            debug!("Ignoring time gate outside a script");
        }
    }

    pub fn now(&self) -> SimTime {
        self.core.now
    }

    pub fn node(&self, addr: NodeAddr) -> Option<&P> {
        self.nodes.get(addr.index())
    }

    pub fn node_mut(&mut self, addr: NodeAddr) -> Option<&mut P> {
        self.nodes.get_mut(addr.index())
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn topology(&self) -> &Topology {
        &self.core.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.core.topology
    }

    pub fn pending_events(&self) -> usize {
        self.core.manager.pending_events()
    }

    pub fn exit_requested(&self) -> bool {
        self.core.manager.exit_requested()
    }

    /// Statistics for the run so far.
    pub fn summary(&self) -> RunSummary {
        self.core
            .manager
            .summary(self.core.now.saturating_duration_since(SimTime::ZERO))
    }
}

impl<P: Protocol> CommandSink for Simulator<P> {
    fn upsert_link(&mut self, a: NodeAddr, b: NodeAddr, profile: LinkProfile) {
        if let Err(e) = self.core.topology.upsert_link(a, b, profile) {
            warn!(%a, %b, error = %e, "Rejected edge");
        }
    }

    fn set_link_live(&mut self, a: NodeAddr, b: NodeAddr, live: bool) -> bool {
        self.core.topology.set_link_live(a, b, live)
    }

    fn set_node_live(&mut self, addr: NodeAddr, live: bool) {
        self.core.topology.set_node_failed(addr, !live);
    }

    fn deliver_message(&mut self, node: Option<NodeAddr>, text: &str) -> bool {
        let Some(addr) = node else {
            return false;
        };
        let Some(target) = self.nodes.get_mut(addr.index()) else {
            return false;
        };
        let mut ctx = SimContext {
            core: &mut self.core,
            addr,
        };
        run_guarded("on_command", || target.on_command(&mut ctx, text));
        true
    }

    fn request_exit(&mut self) {
        self.core.manager.request_exit();
    }
}

enum Input {
    Line(String),
    Timeout,
    Closed,
}

fn wait_for_input(input: &Receiver<String>, wait: Wait) -> Input {
    let received = match wait {
        Wait::None => match input.try_recv() {
            Ok(line) => Ok(line),
            Err(TryRecvError::Empty) => return Input::Timeout,
            Err(TryRecvError::Disconnected) => return Input::Closed,
        },
        Wait::For(timeout) => select! {
            recv(input) -> line => line,
            recv(after(timeout)) -> _ => return Input::Timeout,
        },
        Wait::Forever => input.recv(),
    };
    match received {
        Ok(line) => Input::Line(line),
        Err(_) => Input::Closed,
    }
}
