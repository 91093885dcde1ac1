//! Emulated node side of the directory connection.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use netbed_packet::NodeAddr;
use tracing::{debug, info, warn};

use super::DirectoryMessage;
use crate::EmulatorError;

/// A registration with the neighbor directory.
///
/// Holding the client keeps the TCP connection open; the directory treats a
/// closed connection as the node leaving. Updates pushed by the directory
/// are parsed on a background thread and buffered until [`poll`](Self::poll).
pub struct DirectoryClient {
    addr: NodeAddr,
    stream: TcpStream,
    updates: Receiver<DirectoryMessage>,
    reader: Option<JoinHandle<()>>,
}

impl DirectoryClient {
    /// Connect, announce `udp_port` and wait for the assigned address.
    pub fn register(host: &str, port: u16, udp_port: u16) -> Result<Self, EmulatorError> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            EmulatorError::Handshake(format!("cannot connect to directory at {host}:{port}: {e}"))
        })?;
        stream.set_nodelay(true)?;

        let mut writer = stream.try_clone()?;
        writeln!(writer, "{udp_port}")?;
        writer.flush()?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut reply = String::new();
        if reader.read_line(&mut reply)? == 0 {
            return Err(EmulatorError::Handshake(
                "directory closed the connection during registration".to_string(),
            ));
        }
        let assigned: u8 = reply.trim().parse().map_err(|_| {
            EmulatorError::Handshake(format!(
                "reply from directory is not an address: {:?}",
                reply.trim()
            ))
        })?;
        // The broadcast address is the refusal
        let addr = NodeAddr::unicast(assigned).ok_or(EmulatorError::PortConflict(udp_port))?;
        info!(%addr, udp_port, "Registered with directory");

        let (tx, updates) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("directory-reader".to_string())
            .spawn(move || read_updates(reader, tx))?;

        Ok(DirectoryClient {
            addr,
            stream,
            updates,
            reader: Some(handle),
        })
    }

    /// The address the directory assigned.
    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    /// Buffered updates, without blocking.
    pub fn poll(&self) -> impl Iterator<Item = DirectoryMessage> + '_ {
        self.updates.try_iter()
    }
}

impl Drop for DirectoryClient {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn read_updates(reader: BufReader<TcpStream>, tx: Sender<DirectoryMessage>) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Lost connection to directory");
                return;
            }
        };
        match line.parse::<DirectoryMessage>() {
            Ok(message) => {
                if tx.send(message).is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Ignoring directory line"),
        }
    }
    debug!("Directory connection closed");
}
