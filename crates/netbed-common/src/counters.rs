//! Packet statistics.

use std::fmt;
use std::time::Duration;

use netbed_metrics::{metric_defs, metrics};

/// Process-wide packet counters.
///
/// Only the engine increments these. Each increment is mirrored to the
/// `metrics` facade so an installed recorder sees the same totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounters {
    sent: u64,
    dropped: u64,
    lost: u64,
}

impl PacketCounters {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A packet passed send validation.
    pub fn record_sent(&mut self) {
        self.sent += 1;
        metrics::counter!(metric_defs::PACKETS_SENT.name).increment(1);
    }

    /// A packet was refused because the send buffer would overflow.
    pub fn record_dropped(&mut self) {
        self.dropped += 1;
        metrics::counter!(metric_defs::PACKETS_DROPPED.name).increment(1);
    }

    /// A packet consumed bandwidth but was lost in transmission.
    pub fn record_lost(&mut self) {
        self.lost += 1;
        metrics::counter!(metric_defs::PACKETS_LOST.name).increment(1);
    }

    /// Packets sent.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Packets dropped on buffer overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Packets lost to transmission errors or dead links.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Build the shutdown report.
    pub fn summary(&self, elapsed: Duration) -> RunSummary {
        RunSummary {
            elapsed,
            sent: self.sent,
            dropped: self.dropped,
            lost: self.lost,
        }
    }
}

/// Statistics reported when a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Time the run lasted (virtual in simulation, wall clock in emulation).
    pub elapsed: Duration,
    /// Packets sent.
    pub sent: u64,
    /// Packets dropped on buffer overflow.
    pub dropped: u64,
    /// Packets lost in transmission.
    pub lost: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Exiting after time: {} msec.", self.elapsed.as_millis())?;
        writeln!(f, "Number of packets sent: {}", self.sent)?;
        writeln!(f, "Number of packets dropped: {}", self.dropped)?;
        write!(f, "Number of packets lost: {}", self.lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut counters = PacketCounters::new();
        counters.record_sent();
        counters.record_sent();
        counters.record_dropped();
        counters.record_lost();

        let summary = counters.summary(Duration::from_millis(1500));
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.lost, 1);

        let text = summary.to_string();
        assert!(text.contains("1500 msec"));
        assert!(text.contains("packets dropped: 1"));
    }
}
