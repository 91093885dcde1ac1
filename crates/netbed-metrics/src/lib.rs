//! Metric names and descriptions for netbed.
//!
//! Every metric a backend emits is declared once in [`metric_defs`], so the
//! names used at call sites and the descriptions handed to a recorder cannot
//! drift apart. Emitting goes through the re-exported `metrics` facade; with
//! no recorder installed it costs nothing.
//!
//! ```rust
//! use netbed_metrics::{metric_defs, metrics};
//!
//! netbed_metrics::describe_metrics();
//! metrics::counter!(metric_defs::PACKETS_SENT.name).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One metric: its name, kind, unit and the label keys emitters attach.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricKind,
    pub help: &'static str,
    pub unit: Unit,
    pub labels: &'static [&'static str],
}

impl Metric {
    pub const fn counter(name: &'static str, help: &'static str) -> Self {
        Metric {
            name,
            kind: MetricKind::Counter,
            help,
            unit: Unit::Count,
            labels: &[],
        }
    }

    pub const fn gauge(name: &'static str, help: &'static str) -> Self {
        Metric {
            kind: MetricKind::Gauge,
            ..Self::counter(name, help)
        }
    }

    pub const fn histogram(name: &'static str, help: &'static str, unit: Unit) -> Self {
        Metric {
            kind: MetricKind::Histogram,
            unit,
            ..Self::counter(name, help)
        }
    }

    pub const fn labelled(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Hand the description to the installed recorder.
    pub fn describe(&self) {
        match self.kind {
            MetricKind::Counter => describe_counter!(self.name, self.unit, self.help),
            MetricKind::Gauge => describe_gauge!(self.name, self.unit, self.help),
            MetricKind::Histogram => describe_histogram!(self.name, self.unit, self.help),
        }
    }
}

pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Packets
    // ========================================================================

    pub const PACKETS_SENT: Metric =
        Metric::counter("netbed.packets.sent", "Packets accepted for sending");

    /// Refused because the link's send buffer would overflow.
    pub const PACKETS_DROPPED: Metric =
        Metric::counter("netbed.packets.dropped", "Packets dropped on send buffer overflow");

    /// Consumed bandwidth, then lost.
    pub const PACKETS_LOST: Metric = Metric::counter(
        "netbed.packets.lost",
        "Packets lost to transmission errors or dead links",
    );

    pub const PACKETS_DELIVERED: Metric =
        Metric::counter("netbed.packets.delivered", "Packets delivered to a node")
            .labelled(&["node"]);

    pub const PACKET_SIZE: Metric = Metric::histogram(
        "netbed.packets.size_bytes",
        "Size of packets offered to a link",
        Unit::Bytes,
    );

    // ========================================================================
    // Event loop
    // ========================================================================

    pub const EVENTS_FIRED: Metric =
        Metric::counter("netbed.events.fired", "Scheduled events fired");

    /// Protocol callbacks that panicked. The loop carries on regardless.
    pub const CALLBACKS_FAILED: Metric =
        Metric::counter("netbed.callbacks.failed", "Event callbacks that panicked");

    /// Sampled after each batch of due events.
    pub const EVENT_QUEUE_DEPTH: Metric =
        Metric::gauge("netbed.events.queue_depth", "Events waiting in the queue");

    // ========================================================================
    // Directory
    // ========================================================================

    /// Label `kind` is one of `add`, `remove`, `reset`.
    pub const DIRECTORY_UPDATES: Metric =
        Metric::counter("netbed.directory.updates", "Neighbor directory updates applied")
            .labelled(&["kind"]);

    pub const DIRECTORY_NODES: Metric = Metric::gauge(
        "netbed.directory.nodes",
        "Emulated nodes registered with the directory",
    );

    pub const ALL: &[&Metric] = &[
        &PACKETS_SENT,
        &PACKETS_DROPPED,
        &PACKETS_LOST,
        &PACKETS_DELIVERED,
        &PACKET_SIZE,
        &EVENTS_FIRED,
        &CALLBACKS_FAILED,
        &EVENT_QUEUE_DEPTH,
        &DIRECTORY_UPDATES,
        &DIRECTORY_NODES,
    ];
}

/// Describe every metric in [`metric_defs::ALL`]. Call once after installing
/// a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_units() {
        assert_eq!(metric_defs::PACKETS_SENT.kind, MetricKind::Counter);
        assert_eq!(metric_defs::PACKETS_SENT.unit, Unit::Count);
        assert_eq!(metric_defs::PACKET_SIZE.kind, MetricKind::Histogram);
        assert_eq!(metric_defs::PACKET_SIZE.unit, Unit::Bytes);
        assert_eq!(metric_defs::DIRECTORY_NODES.kind, MetricKind::Gauge);
        assert_eq!(metric_defs::DIRECTORY_UPDATES.labels, &["kind"]);
        assert!(metric_defs::EVENTS_FIRED.labels.is_empty());
    }

    #[test]
    fn test_names_are_unique_and_namespaced() {
        let mut names: Vec<_> = metric_defs::ALL.iter().map(|m| m.name).collect();
        assert!(names.iter().all(|name| name.starts_with("netbed.")));
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
