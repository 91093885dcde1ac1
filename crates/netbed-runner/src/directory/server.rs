//! Directory server.
//!
//! [`DirectoryState`] is a synchronous state machine: registrations and
//! topology commands go in, per-node [`DirectoryMessage`]s come out. The
//! [`DirectoryServer`] drives it from a tokio accept loop with one task per
//! connection, and the topology script runs as a task sleeping until each
//! time gate.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use netbed_common::SimTime;
use netbed_link::{LinkProfile, Topology};
use netbed_metrics::{metric_defs, metrics};
use netbed_packet::{NodeAddr, BROADCAST_ADDRESS};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::DirectoryMessage;
use crate::command::{execute_line, CommandMode, CommandParser, CommandScript, CommandSink};
use crate::{DirectoryConfig, DirectoryError};

// ============================================================================
// State machine
// ============================================================================

/// Why a registration was refused. The node is answered with the broadcast
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Illegal port: {0}")]
    ReservedPort(u16),

    #[error("Port {port} on {ip} is already registered")]
    PortInUse { ip: IpAddr, port: u16 },

    #[error("Out of addresses")]
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    ip: IpAddr,
    port: u16,
}

/// Registered nodes, the topology, and the updates owed to each node.
#[derive(Debug)]
pub struct DirectoryState {
    topology: Topology,
    nodes: BTreeMap<NodeAddr, Registration>,
    outbox: Vec<(NodeAddr, DirectoryMessage)>,
    exit_requested: bool,
}

impl DirectoryState {
    pub fn new(topology: Topology) -> Self {
        DirectoryState {
            topology,
            nodes: BTreeMap::new(),
            outbox: Vec::new(),
            exit_requested: false,
        }
    }

    /// Assign the lowest free address to the node reachable at `ip:port` and
    /// introduce it to its live neighbors.
    pub fn register(&mut self, ip: IpAddr, port: u16) -> Result<NodeAddr, Rejection> {
        if port < 1024 {
            return Err(Rejection::ReservedPort(port));
        }
        if self.nodes.values().any(|r| r.ip == ip && r.port == port) {
            return Err(Rejection::PortInUse { ip, port });
        }
        let addr = (0..=u8::MAX)
            .filter_map(NodeAddr::unicast)
            .find(|addr| !self.nodes.contains_key(addr))
            .ok_or(Rejection::Exhausted)?;

        self.nodes.insert(addr, Registration { ip, port });
        metrics::gauge!(metric_defs::DIRECTORY_NODES.name).set(self.nodes.len() as f64);
        info!(%addr, %ip, port, "Assigned address");

        for other in self.others(addr) {
            self.announce_pair(addr, other);
        }
        Ok(addr)
    }

    /// Forget a node whose connection closed and tell its neighbors.
    pub fn unregister(&mut self, addr: NodeAddr) {
        if self.nodes.remove(&addr).is_none() {
            return;
        }
        metrics::gauge!(metric_defs::DIRECTORY_NODES.name).set(self.nodes.len() as f64);
        info!(%addr, "Removing node");
        self.withdraw(addr);
    }

    /// Updates queued since the last call, in the order they were produced.
    pub fn take_outgoing(&mut self) -> Vec<(NodeAddr, DirectoryMessage)> {
        mem::take(&mut self.outbox)
    }

    pub fn is_registered(&self, addr: NodeAddr) -> bool {
        self.nodes.contains_key(&addr)
    }

    pub fn registered(&self) -> Vec<NodeAddr> {
        self.nodes.keys().copied().collect()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    fn others(&self, addr: NodeAddr) -> Vec<NodeAddr> {
        self.nodes.keys().copied().filter(|&other| other != addr).collect()
    }

    fn queue(&mut self, to: NodeAddr, message: DirectoryMessage) {
        if self.nodes.contains_key(&to) {
            self.outbox.push((to, message));
        }
    }

    fn add_message(&self, about: NodeAddr, profile: LinkProfile) -> Option<DirectoryMessage> {
        let registration = self.nodes.get(&about)?;
        Some(DirectoryMessage::Add {
            addr: about,
            host: registration.ip.to_string(),
            port: registration.port,
            profile: Some(profile),
        })
    }

    /// Tell `a` and `b` about each other if both are registered and the link
    /// between them is usable.
    fn announce_pair(&mut self, a: NodeAddr, b: NodeAddr) {
        let Some(profile) = self.topology.live_profile(a, b) else {
            return;
        };
        let (Some(to_a), Some(to_b)) = (self.add_message(b, profile), self.add_message(a, profile))
        else {
            return;
        };
        self.queue(a, to_a);
        self.queue(b, to_b);
    }

    /// Tell every live neighbor of `addr` to forget it.
    fn withdraw(&mut self, addr: NodeAddr) {
        for other in self.others(addr) {
            if self.topology.live_profile(other, addr).is_some() {
                self.queue(other, DirectoryMessage::Remove(addr));
            }
        }
    }
}

impl CommandSink for DirectoryState {
    fn upsert_link(&mut self, a: NodeAddr, b: NodeAddr, profile: LinkProfile) {
        if let Err(e) = self.topology.upsert_link(a, b, profile) {
            warn!(%a, %b, error = %e, "Rejected edge");
            return;
        }
        self.announce_pair(a, b);
    }

    fn set_link_live(&mut self, a: NodeAddr, b: NodeAddr, live: bool) -> bool {
        if !self.topology.set_link_live(a, b, live) {
            return false;
        }
        if live {
            self.announce_pair(a, b);
        } else if self.is_registered(a) && self.is_registered(b) {
            self.queue(a, DirectoryMessage::Remove(b));
            self.queue(b, DirectoryMessage::Remove(a));
        }
        true
    }

    fn set_node_live(&mut self, addr: NodeAddr, live: bool) {
        if live {
            self.topology.set_node_failed(addr, false);
            for other in self.others(addr) {
                self.announce_pair(addr, other);
            }
        } else {
            // Neighbors are found through the topology, so notify before failing
            self.queue(addr, DirectoryMessage::Reset);
            self.withdraw(addr);
            self.topology.set_node_failed(addr, true);
        }
    }

    fn deliver_message(&mut self, _node: Option<NodeAddr>, _text: &str) -> bool {
        false
    }

    fn request_exit(&mut self) {
        self.exit_requested = true;
    }
}

// ============================================================================
// Server
// ============================================================================

struct Shared {
    state: Mutex<DirectoryState>,
    peers: Mutex<BTreeMap<NodeAddr, mpsc::UnboundedSender<String>>>,
    shutdown: Notify,
    started: Instant,
}

impl Shared {
    fn now(&self) -> SimTime {
        SimTime::from_micros(self.started.elapsed().as_micros() as u64)
    }

    /// Hand queued updates to the connection writers and honor `exit`.
    fn flush(&self) {
        let mut state = self.state.lock();
        let peers = self.peers.lock();
        for (to, message) in state.take_outgoing() {
            debug!(%to, %message, "Directory update");
            if let Some(tx) = peers.get(&to) {
                let _ = tx.send(message.to_string());
            }
        }
        if state.exit_requested() {
            self.shutdown.notify_one();
        }
    }
}

/// A cloneable way to feed control commands to a running server.
#[derive(Clone)]
pub struct DirectoryHandle {
    shared: Arc<Shared>,
    parser: CommandParser,
}

impl DirectoryHandle {
    /// Parse and apply one command line.
    pub fn execute(&self, line: &str) {
        let now = self.shared.now();
        {
            let mut state = self.shared.state.lock();
            if execute_line(&mut *state, &self.parser, line, now).is_some() {
                debug!("Ignoring time gate outside a script");
            }
        }
        self.shared.flush();
    }

    /// Stop the accept loop.
    pub fn shutdown(&self) {
        self.shared.state.lock().request_exit();
        self.shared.shutdown.notify_one();
    }

    /// Addresses currently registered.
    pub fn registered(&self) -> Vec<NodeAddr> {
        self.shared.state.lock().registered()
    }
}

/// The directory's TCP front end.
pub struct DirectoryServer {
    listener: TcpListener,
    handle: DirectoryHandle,
}

impl DirectoryServer {
    /// Bind the listening socket.
    pub async fn bind(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .map_err(|source| DirectoryError::Bind {
                port: config.listen_port,
                source,
            })?;

        let topology = if config.all_to_all {
            Topology::all_to_all()
        } else {
            Topology::new()
        }
        .with_default_profile(config.default_profile);

        let shared = Arc::new(Shared {
            state: Mutex::new(DirectoryState::new(topology)),
            peers: Mutex::new(BTreeMap::new()),
            shutdown: Notify::new(),
            started: Instant::now(),
        });
        let parser = CommandParser::new(CommandMode::Directory)
            .with_default_profile(config.default_profile);

        Ok(DirectoryServer {
            listener,
            handle: DirectoryHandle { shared, parser },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> DirectoryHandle {
        self.handle.clone()
    }

    /// Serve registrations until `exit`. The topology script is applied up
    /// to its first time gate before the first registration is accepted.
    pub async fn run(self, topology: Option<CommandScript>) -> Result<(), DirectoryError> {
        let shared = self.handle.shared.clone();

        if let Some(mut script) = topology {
            let parser = self.handle.parser.clone();
            let gate = {
                let mut state = shared.state.lock();
                script.run_until_gate(&parser, &mut *state, shared.now())
            };
            shared.flush();
            if let Some(gate) = gate {
                tokio::spawn(run_topology(shared.clone(), script, parser, gate));
            }
        }

        info!(addr = %self.listener.local_addr()?, "Directory awaiting nodes");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(shared.clone(), stream, peer));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                _ = shared.shutdown.notified() => {
                    info!("Directory exiting");
                    return Ok(());
                }
            }
        }
    }
}

async fn run_topology(
    shared: Arc<Shared>,
    mut script: CommandScript,
    parser: CommandParser,
    mut gate: SimTime,
) {
    loop {
        let wait = gate.saturating_duration_since(shared.now());
        tokio::time::sleep(wait).await;

        let next = {
            let mut state = shared.state.lock();
            script.run_until_gate(&parser, &mut *state, shared.now())
        };
        shared.flush();
        match next {
            Some(next) => gate = next,
            None => return,
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, error = %e, "Failed to disable Nagle");
    }
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let port = match lines.next_line().await {
        Ok(Some(line)) => match line.trim().parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                warn!(%peer, %line, "Registration is not a port number");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            warn!(%peer, error = %e, "Failed to read registration");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let registered = {
        let mut state = shared.state.lock();
        state.register(peer.ip(), port).map(|addr| {
            // The assigned address goes out ahead of any neighbor updates
            let _ = tx.send(addr.to_string());
            shared.peers.lock().insert(addr, tx);
            addr
        })
    };
    let addr = match registered {
        Ok(addr) => addr,
        Err(rejection) => {
            warn!(%peer, port, %rejection, "Rejected registration");
            let reply = format!("{BROADCAST_ADDRESS}\n");
            let _ = write_half.write_all(reply.as_bytes()).await;
            return;
        }
    };
    shared.flush();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let line = format!("{line}\n");
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    // Nodes send nothing after registering; EOF means the node is gone
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(%addr, %line, "Ignoring line from node"),
            Ok(None) => break,
            Err(e) => {
                debug!(%addr, error = %e, "Connection error");
                break;
            }
        }
    }

    {
        let mut state = shared.state.lock();
        state.unregister(addr);
        shared.peers.lock().remove(&addr);
    }
    shared.flush();
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn add(addr: u8, port: u16, profile: LinkProfile) -> DirectoryMessage {
        DirectoryMessage::Add {
            addr: NodeAddr(addr),
            host: "127.0.0.1".to_string(),
            port,
            profile: Some(profile),
        }
    }

    fn parser() -> CommandParser {
        CommandParser::new(CommandMode::Directory)
    }

    #[test]
    fn test_registration_rules() {
        let mut state = DirectoryState::new(Topology::all_to_all());
        assert_eq!(state.register(LOCAL, 80), Err(Rejection::ReservedPort(80)));
        assert_eq!(state.register(LOCAL, 5000), Ok(NodeAddr(0)));
        assert_eq!(
            state.register(LOCAL, 5000),
            Err(Rejection::PortInUse { ip: LOCAL, port: 5000 })
        );
        assert_eq!(state.register(LOCAL, 5001), Ok(NodeAddr(1)));

        // Lowest free address is reused
        state.unregister(NodeAddr(0));
        assert_eq!(state.register(LOCAL, 5002), Ok(NodeAddr(0)));
    }

    #[test]
    fn test_addresses_run_out() {
        let mut state = DirectoryState::new(Topology::new());
        for port in 0..255u16 {
            assert!(state.register(LOCAL, 2000 + port).is_ok());
        }
        assert_eq!(state.register(LOCAL, 9999), Err(Rejection::Exhausted));
    }

    #[test]
    fn test_all_to_all_introductions() {
        let profile = LinkProfile::default();
        let mut state = DirectoryState::new(Topology::all_to_all());
        state.register(LOCAL, 5000).unwrap();
        assert!(state.take_outgoing().is_empty());

        state.register(LOCAL, 5001).unwrap();
        assert_eq!(
            state.take_outgoing(),
            vec![
                (NodeAddr(1), add(0, 5000, profile)),
                (NodeAddr(0), add(1, 5001, profile)),
            ]
        );

        state.unregister(NodeAddr(1));
        assert_eq!(
            state.take_outgoing(),
            vec![(NodeAddr(0), DirectoryMessage::Remove(NodeAddr(1)))]
        );
    }

    #[test]
    fn test_topology_limits_introductions() {
        let slow = LinkProfile::default().with_delay(Duration::from_millis(40));
        let mut state = DirectoryState::new(Topology::new());
        execute_line(&mut state, &parser(), "edge 0 2 lossRate 0 delay 40", SimTime::ZERO);
        for port in [5000, 5001, 5002] {
            state.register(LOCAL, port).unwrap();
        }
        assert_eq!(
            state.take_outgoing(),
            vec![
                (NodeAddr(2), add(0, 5000, slow)),
                (NodeAddr(0), add(2, 5002, slow)),
            ]
        );

        // A new edge between registered nodes is announced at once
        execute_line(&mut state, &parser(), "edge 1 2", SimTime::ZERO);
        assert_eq!(state.take_outgoing().len(), 2);
    }

    #[test]
    fn test_link_fail_and_restart() {
        let profile = LinkProfile::default();
        let mut state = DirectoryState::new(Topology::new());
        execute_line(&mut state, &parser(), "edge 0 1", SimTime::ZERO);
        state.register(LOCAL, 5000).unwrap();
        state.register(LOCAL, 5001).unwrap();
        state.take_outgoing();

        execute_line(&mut state, &parser(), "fail 0 1", SimTime::ZERO);
        assert_eq!(
            state.take_outgoing(),
            vec![
                (NodeAddr(0), DirectoryMessage::Remove(NodeAddr(1))),
                (NodeAddr(1), DirectoryMessage::Remove(NodeAddr(0))),
            ]
        );

        execute_line(&mut state, &parser(), "restart 0 1", SimTime::ZERO);
        assert_eq!(
            state.take_outgoing(),
            vec![
                (NodeAddr(0), add(1, 5001, profile)),
                (NodeAddr(1), add(0, 5000, profile)),
            ]
        );
    }

    #[test]
    fn test_node_fail_and_restart() {
        let profile = LinkProfile::default();
        let mut state = DirectoryState::new(Topology::all_to_all());
        for port in [5000, 5001, 5002] {
            state.register(LOCAL, port).unwrap();
        }
        state.take_outgoing();

        execute_line(&mut state, &parser(), "fail 1", SimTime::ZERO);
        assert_eq!(
            state.take_outgoing(),
            vec![
                (NodeAddr(1), DirectoryMessage::Reset),
                (NodeAddr(0), DirectoryMessage::Remove(NodeAddr(1))),
                (NodeAddr(2), DirectoryMessage::Remove(NodeAddr(1))),
            ]
        );
        assert!(state.topology().is_node_failed(NodeAddr(1)));

        execute_line(&mut state, &parser(), "restart 1", SimTime::ZERO);
        assert_eq!(
            state.take_outgoing(),
            vec![
                (NodeAddr(1), add(0, 5000, profile)),
                (NodeAddr(0), add(1, 5001, profile)),
                (NodeAddr(1), add(2, 5002, profile)),
                (NodeAddr(2), add(1, 5001, profile)),
            ]
        );
    }

    #[test]
    fn test_exit_and_messages() {
        let mut state = DirectoryState::new(Topology::new());
        execute_line(&mut state, &parser(), "3 hello", SimTime::ZERO);
        assert!(!state.exit_requested());
        execute_line(&mut state, &parser(), "exit", SimTime::ZERO);
        assert!(state.exit_requested());
    }
}
