//! Lines pushed from the directory to emulated nodes.
//!
//! ```text
//! reset
//! remove <addr>
//! add <addr> <host> <port>
//! add <addr> <host> <port> lossRate <f64> delay <ms> bw <B/s> bt <ms>
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use netbed_link::LinkProfile;
use netbed_packet::NodeAddr;

use crate::DirectoryError;

/// One neighbor-set update for an emulated node.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryMessage {
    /// Forget every neighbor.
    Reset,
    /// Forget one neighbor.
    Remove(NodeAddr),
    /// Learn or refresh a neighbor's transport address, optionally with the
    /// profile of the link to it.
    Add {
        addr: NodeAddr,
        host: String,
        port: u16,
        profile: Option<LinkProfile>,
    },
}

impl fmt::Display for DirectoryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryMessage::Reset => write!(f, "reset"),
            DirectoryMessage::Remove(addr) => write!(f, "remove {addr}"),
            DirectoryMessage::Add {
                addr,
                host,
                port,
                profile,
            } => {
                write!(f, "add {addr} {host} {port}")?;
                if let Some(p) = profile {
                    write!(
                        f,
                        " lossRate {} delay {} bw {} bt {}",
                        p.loss_rate,
                        p.delay.as_millis(),
                        p.bandwidth,
                        p.buffer_time.as_millis()
                    )?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for DirectoryMessage {
    type Err = DirectoryError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || DirectoryError::Malformed(line.to_string());
        let args: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(' ').collect();

        match (args[0], args.len()) {
            ("reset", 1) => Ok(DirectoryMessage::Reset),
            ("remove", 2) => {
                let addr = args[1].parse().map_err(|_| malformed())?;
                Ok(DirectoryMessage::Remove(addr))
            }
            ("add", 4) | ("add", 12) => {
                let addr = args[1].parse().map_err(|_| malformed())?;
                let host = args[2].to_string();
                let port = args[3].parse().map_err(|_| malformed())?;
                let profile = if args.len() == 12 {
                    Some(parse_profile(&args[4..]).ok_or_else(malformed)?)
                } else {
                    None
                };
                Ok(DirectoryMessage::Add {
                    addr,
                    host,
                    port,
                    profile,
                })
            }
            _ => Err(malformed()),
        }
    }
}

/// `lossRate f delay ms bw B bt ms`, all keywords in place.
fn parse_profile(args: &[&str]) -> Option<LinkProfile> {
    let keywords = ["lossRate", "delay", "bw", "bt"];
    if args.len() != 8 || args.iter().step_by(2).zip(keywords).any(|(a, k)| *a != k) {
        return None;
    }
    let profile = LinkProfile {
        loss_rate: args[1].parse().ok()?,
        delay: Duration::from_millis(args[3].parse().ok()?),
        bandwidth: args[5].parse().ok()?,
        buffer_time: Duration::from_millis(args[7].parse().ok()?),
    };
    profile.validate().ok()?;
    Some(profile)
}
