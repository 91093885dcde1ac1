//! Emulation of one node per process over real UDP.
//!
//! The node registers with the neighbor directory, which assigns its address
//! and keeps its [`ArpCache`] up to date. Packets leave through the emulated
//! [`PhysicalLink`](netbed_link::PhysicalLink) to each neighbor: the link
//! decides when (or whether) the datagram is actually written to the socket,
//! so delay, bandwidth, buffering and loss apply on the sending side.
//!
//! The clock is wall time since the emulator was created. A receiver thread
//! forwards datagrams over a channel, and the main loop multiplexes that
//! channel, keyboard input and the next scheduled event.

mod arp;

pub use arp::{ArpCache, ArpEntry};

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, Receiver, Sender};
use netbed_common::{RunSummary, SimTime};
use netbed_link::{Admission, LinkProfile};
use netbed_metrics::{metric_defs, metrics};
use netbed_packet::{Frame, NodeAddr};
use tracing::{debug, info, trace, warn};

use crate::command::{execute_line, CommandMode, CommandParser, CommandScript, CommandSink};
use crate::directory::DirectoryClient;
use crate::manager::{run_guarded, Manager};
use crate::protocol::{NodeContext, Protocol, TimerFn};
use crate::{EmulatorConfig, EmulatorError, ManagerError};

/// How often the receiver thread checks whether it should stop.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive buffer size. Larger than any valid frame so oversized datagrams
/// are detected rather than truncated.
const RECEIVE_BUFFER_SIZE: usize = 2048;

/// Scheduled work in the emulator.
enum EmuAction<P> {
    /// The node's timer fires.
    Timer(TimerFn<P>),
    /// A datagram leaves the emulated link.
    PhysicalSend { datagram: Vec<u8>, to: SocketAddr },
}

/// State reachable from inside node callbacks.
struct EmuCore<P> {
    manager: Manager<EmuAction<P>>,
    addr: NodeAddr,
    arp: ArpCache,
    socket: UdpSocket,
    directory: DirectoryClient,
    started: Instant,
}

impl<P> EmuCore<P> {
    fn now(&self) -> SimTime {
        SimTime::from_micros(self.started.elapsed().as_micros() as u64)
    }

    /// Apply buffered directory updates.
    fn refresh_arp(&mut self) {
        for message in self.directory.poll() {
            trace!(%message, "Directory update");
            self.arp.apply(message);
        }
    }

    fn send(&mut self, to: NodeAddr, packet: &[u8]) -> Result<bool, ManagerError> {
        let from = self.addr;
        self.manager.validate_send(from, to, packet)?;
        self.refresh_arp();

        if to.is_broadcast() {
            for neighbor in self.arp.neighbors() {
                self.schedule_frame(neighbor, to, packet)?;
            }
            return Ok(true);
        }
        if self.arp.contains(to) {
            self.schedule_frame(to, to, packet)?;
            return Ok(true);
        }
        warn!("Node {to} is not a neighbor of node {from}");
        Ok(false)
    }

    /// Frame a packet addressed to `to` (the next hop, or broadcast) and hand
    /// it to the link towards `next_hop`, or straight to the socket when no
    /// link profile is known.
    fn schedule_frame(
        &mut self,
        next_hop: NodeAddr,
        to: NodeAddr,
        packet: &[u8],
    ) -> Result<(), ManagerError> {
        let now = self.now();
        let Some(entry) = self.arp.get_mut(next_hop) else {
            return Ok(());
        };
        let socket = entry.addr;
        let datagram = Frame::new(to, self.addr, packet.to_vec()).encode();

        let Some(link) = entry.link.as_mut() else {
            send_datagram(&self.socket, &datagram, socket);
            return Ok(());
        };
        match self.manager.admit_physical(link, packet.len(), now)? {
            // The socket is serviced at millisecond granularity
            Admission::Delivered(at) => self.manager.add_timer_at(
                at.ceil_millis(),
                EmuAction::PhysicalSend {
                    datagram,
                    to: socket,
                },
            ),
            Admission::Dropped(reason) => {
                trace!(dest = %next_hop, reason = reason.as_str(), "Packet not sent");
            }
        }
        Ok(())
    }
}

fn send_datagram(socket: &UdpSocket, datagram: &[u8], to: SocketAddr) {
    if let Err(e) = socket.send_to(datagram, to) {
        warn!(%to, error = %e, "Failed to send datagram");
    }
}

/// The view of the emulator the node sees while one of its callbacks runs.
struct EmuContext<'a, P> {
    core: &'a mut EmuCore<P>,
}

impl<P> NodeContext<P> for EmuContext<'_, P> {
    fn addr(&self) -> NodeAddr {
        self.core.addr
    }

    fn now(&self) -> SimTime {
        self.core.now()
    }

    fn send(&mut self, to: NodeAddr, packet: &[u8]) -> Result<bool, ManagerError> {
        self.core.send(to, packet)
    }

    fn add_timer_at(&mut self, at: SimTime, callback: TimerFn<P>) {
        self.core.manager.add_timer_at(at, EmuAction::Timer(callback));
    }
}

/// Emulation backend for a single node.
pub struct Emulator<P> {
    node: P,
    core: EmuCore<P>,
    parser: CommandParser,
    inbound: Receiver<(Vec<u8>, SocketAddr)>,
    input: Receiver<String>,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    started: bool,
}

enum Ready {
    Datagram(Vec<u8>, SocketAddr),
    InboundClosed,
    Line(String),
    InputClosed,
    Timeout,
}

impl<P: Protocol> Emulator<P> {
    /// Bind the local UDP port, register with the directory and build the
    /// node for the assigned address.
    pub fn connect(
        config: &EmulatorConfig,
        factory: impl FnOnce(NodeAddr) -> P,
    ) -> Result<Self, EmulatorError> {
        let socket =
            UdpSocket::bind(("0.0.0.0", config.local_port)).map_err(|source| EmulatorError::Bind {
                port: config.local_port,
                source,
            })?;
        let local_port = socket.local_addr()?.port();

        let directory =
            DirectoryClient::register(&config.directory_host, config.directory_port, local_port)?;
        let addr = directory.addr();

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, inbound) = crossbeam_channel::unbounded();
        let receiver = {
            let socket = socket.try_clone()?;
            socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("udp-receiver-{addr}"))
                .spawn(move || receive_datagrams(socket, tx, stop))?
        };

        info!(%addr, port = local_port, "Emulator started");

        Ok(Emulator {
            node: factory(addr),
            core: EmuCore {
                manager: Manager::new(config.seed),
                addr,
                arp: ArpCache::new(),
                socket,
                directory,
                started: Instant::now(),
            },
            parser: CommandParser::new(CommandMode::Emulation),
            inbound,
            input: never(),
            stop,
            receiver: Some(receiver),
            started: false,
        })
    }

    /// Feed a command script one line per loop iteration.
    pub fn set_command_script(&mut self, script: CommandScript) {
        self.core.manager.set_command_script(script);
    }

    /// Start the node. Called by the run methods if not called before.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let mut ctx = EmuContext {
            core: &mut self.core,
        };
        self.node.start(&mut ctx);
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run until `exit`. Keyboard lines arrive on `input`.
    pub fn run(&mut self, input: Receiver<String>) -> RunSummary {
        self.input = input;
        self.start();
        while !self.core.manager.exit_requested() {
            self.step(None);
        }
        info!(addr = %self.core.addr, "Emulator exiting");
        self.summary()
    }

    /// Run for `duration` of wall time or until `exit`.
    pub fn run_for(&mut self, duration: Duration) {
        self.start();
        let deadline = Instant::now() + duration;
        while !self.core.manager.exit_requested() && Instant::now() < deadline {
            self.step(Some(deadline));
        }
    }

    /// One loop iteration: apply the command script, directory updates and
    /// due events, then block until the next event, a datagram, a keyboard
    /// line or `deadline`, and handle whichever came first.
    fn step(&mut self, deadline: Option<Instant>) {
        self.feed_command_script();
        self.core.refresh_arp();
        self.fire_due_events();
        if self.core.manager.exit_requested() {
            return;
        }

        let now = self.core.now();
        let until_next = self
            .next_wakeup()
            .map(|at| at.saturating_duration_since(now));
        let until_deadline = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let timeout = match (until_next, until_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match wait_ready(&self.inbound, &self.input, timeout) {
            Ready::Datagram(datagram, from) => self.process_datagram(&datagram, from),
            Ready::InboundClosed => {
                warn!("Receiver thread stopped");
                self.inbound = never();
            }
            Ready::Line(line) => self.execute_command(&line),
            Ready::InputClosed => self.input = never(),
            Ready::Timeout => {}
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
        let now = self.core.now();
        if let Some(line) = self.core.manager.next_command(now) {
            let parser = self.parser.clone();
            if let Some(gate) = execute_line(self, &parser, &line, now) {
                self.core.manager.defer_commands_until(gate);
            }
        }
    }

    fn fire_due_events(&mut self) {
        let now = self.core.now();
        while let Some(action) = self.core.manager.pop_due(now) {
            match action {
                EmuAction::Timer(callback) => {
                    let node = &mut self.node;
                    let mut ctx = EmuContext {
                        core: &mut self.core,
                    };
                    run_guarded("timer", || callback(node, &mut ctx));
                }
                EmuAction::PhysicalSend { datagram, to } => {
                    send_datagram(&self.core.socket, &datagram, to);
                }
            }
        }
        metrics::gauge!(metric_defs::EVENT_QUEUE_DEPTH.name)
            .set(self.core.manager.pending_events() as f64);
    }

    /// Handle one inbound datagram: learn where the sender lives, then hand
    /// the packet to the node if this node is the frame's next hop.
    ///
    /// The packet bytes are not inspected. A packet whose final destination
    /// is elsewhere is still delivered so protocol code can forward it.
    fn process_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%from, error = %e, "Dropping undecodable datagram");
                return;
            }
        };

        self.core.arp.observe(frame.src, from);

        let addr = self.core.addr;
        if frame.dest != addr && !frame.dest.is_broadcast() {
            trace!(dest = %frame.dest, "Frame not addressed to this node");
            return;
        }
        metrics::counter!(metric_defs::PACKETS_DELIVERED.name, "node" => addr.to_string())
            .increment(1);
        let node = &mut self.node;
        let mut ctx = EmuContext {
            core: &mut self.core,
        };
        run_guarded("on_receive", || node.on_receive(&mut ctx, frame.src, &frame.packet));
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Parse and apply one command line as if it were typed at the console.
    pub fn execute_command(&mut self, line: &str) {
        let parser = self.parser.clone();
        let now = self.core.now();
        if execute_line(self, &parser, line, now).is_some() {
            debug!("Ignoring time gate outside a script");
        }
    }

    /// The address the directory assigned.
    pub fn addr(&self) -> NodeAddr {
        self.core.addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.socket.local_addr()
    }

    pub fn now(&self) -> SimTime {
        self.core.now()
    }

    pub fn node(&self) -> &P {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut P {
        &mut self.node
    }

    /// Neighbors known so far. Directory updates are applied at the top of
    /// each loop iteration and before every send.
    pub fn arp(&self) -> &ArpCache {
        &self.core.arp
    }

    pub fn pending_events(&self) -> usize {
        self.core.manager.pending_events()
    }

    pub fn exit_requested(&self) -> bool {
        self.core.manager.exit_requested()
    }

    /// Statistics for the run so far.
    pub fn summary(&self) -> RunSummary {
        self.core.manager.summary(self.core.started.elapsed())
    }
}

impl<P: Protocol> CommandSink for Emulator<P> {
    fn upsert_link(&mut self, a: NodeAddr, b: NodeAddr, _profile: LinkProfile) {
        warn!(%a, %b, "Edges are managed by the directory");
    }

    fn set_link_live(&mut self, a: NodeAddr, b: NodeAddr, _live: bool) -> bool {
        warn!(%a, %b, "Links are managed by the directory");
        true
    }

    fn set_node_live(&mut self, addr: NodeAddr, _live: bool) {
        warn!(%addr, "Node failures are managed by the directory");
    }

    fn deliver_message(&mut self, node: Option<NodeAddr>, text: &str) -> bool {
        if node.is_some_and(|addr| addr != self.core.addr) {
            return false;
        }
        let target = &mut self.node;
        let mut ctx = EmuContext {
            core: &mut self.core,
        };
        run_guarded("on_command", || target.on_command(&mut ctx, text));
        true
    }

    fn request_exit(&mut self) {
        self.core.manager.request_exit();
    }
}

impl<P> Drop for Emulator<P> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

fn wait_ready(
    inbound: &Receiver<(Vec<u8>, SocketAddr)>,
    input: &Receiver<String>,
    timeout: Option<Duration>,
) -> Ready {
    let timer = match timeout {
        Some(timeout) => after(timeout),
        None => never(),
    };
    select! {
        recv(inbound) -> msg => match msg {
            Ok((datagram, from)) => Ready::Datagram(datagram, from),
            Err(_) => Ready::InboundClosed,
        },
        recv(input) -> line => match line {
            Ok(line) => Ready::Line(line),
            Err(_) => Ready::InputClosed,
        },
        recv(timer) -> _ => Ready::Timeout,
    }
}

fn receive_datagrams(socket: UdpSocket, tx: Sender<(Vec<u8>, SocketAddr)>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if tx.send((buf[..len].to_vec(), from)).is_err() {
                    return;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!(error = %e, "UDP receive failed");
                thread::sleep(RECEIVE_POLL_INTERVAL);
            }
        }
    }
    debug!("Receiver thread stopped");
}
