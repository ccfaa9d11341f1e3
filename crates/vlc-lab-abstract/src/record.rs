use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{Layer, RunConfig};

/// Physical or causal constraint a packet record breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    UdpReceivedWithoutUdpSend,
    UdpReceivedWithoutLinkSend,
    UdpReceivedWithoutLinkReceive,
    LinkReceivedWithoutUdpSend,
    LinkReceivedWithoutLinkSend,
    /// Link transmission started before the UDP send call that triggered it.
    LinkSendBeforeUdpSend,
    /// The transport latency is smaller than the link latency it contains.
    LinkLatencyExceedsUdp,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Violation::UdpReceivedWithoutUdpSend => "udp packet received but not sent",
            Violation::UdpReceivedWithoutLinkSend => {
                "udp packet received but not sent at link layer"
            }
            Violation::UdpReceivedWithoutLinkReceive => {
                "udp packet received but no link layer latency"
            }
            Violation::LinkReceivedWithoutUdpSend => {
                "link layer packet received but no udp packet sent"
            }
            Violation::LinkReceivedWithoutLinkSend => {
                "link layer packet received but not sent at link layer"
            }
            Violation::LinkSendBeforeUdpSend => "link layer send time < udp send time",
            Violation::LinkLatencyExceedsUdp => "link layer latency > udp latency",
        };
        f.write_str(text)
    }
}

/// Measured values of one packet. `None` means the event never happened.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PacketTimings {
    /// UDP send call, seconds after the run anchor.
    pub udp_send_time_s: Option<f64>,
    /// Link layer send start, seconds after the run anchor.
    pub link_send_time_s: Option<f64>,
    pub link_latency_ms: Option<f64>,
    pub udp_latency_ms: Option<f64>,
}

impl PacketTimings {
    fn violations(&self) -> Vec<Violation> {
        let mut found = Vec::new();

        if self.udp_latency_ms.is_some() {
            if self.udp_send_time_s.is_none() {
                found.push(Violation::UdpReceivedWithoutUdpSend);
            }
            if self.link_send_time_s.is_none() {
                found.push(Violation::UdpReceivedWithoutLinkSend);
            }
            if self.link_latency_ms.is_none() {
                found.push(Violation::UdpReceivedWithoutLinkReceive);
            }
        }

        if self.link_latency_ms.is_some() {
            if self.udp_send_time_s.is_none() {
                found.push(Violation::LinkReceivedWithoutUdpSend);
            }
            if self.link_send_time_s.is_none() {
                found.push(Violation::LinkReceivedWithoutLinkSend);
            }
        }

        if let (Some(link), Some(udp)) = (self.link_send_time_s, self.udp_send_time_s)
            && link < udp
        {
            found.push(Violation::LinkSendBeforeUdpSend);
        }

        if let (Some(link), Some(udp)) = (self.link_latency_ms, self.udp_latency_ms)
            && link > udp
        {
            found.push(Violation::LinkLatencyExceedsUdp);
        }

        found
    }
}

/// Reconstructed record of one packet.
///
/// Immutable once built; its validity is decided at construction and kept
/// alongside the values. Invalid records are retained so callers can still
/// use the partial data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketRecord {
    sequence_number: u64,
    udp_send_time_s: Option<f64>,
    link_send_time_s: Option<f64>,
    link_latency_ms: Option<f64>,
    udp_latency_ms: Option<f64>,
    violations: Vec<Violation>,
}

impl PacketRecord {
    pub fn new(sequence_number: u64, timings: PacketTimings) -> Self {
        Self {
            sequence_number,
            udp_send_time_s: timings.udp_send_time_s,
            link_send_time_s: timings.link_send_time_s,
            link_latency_ms: timings.link_latency_ms,
            udp_latency_ms: timings.udp_latency_ms,
            violations: timings.violations(),
        }
    }

    /// Packet that was never sent at any layer.
    pub fn lost_before_send(sequence_number: u64) -> Self {
        Self::new(sequence_number, PacketTimings::default())
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn udp_send_time_s(&self) -> Option<f64> {
        self.udp_send_time_s
    }

    pub fn link_send_time_s(&self) -> Option<f64> {
        self.link_send_time_s
    }

    pub fn link_latency_ms(&self) -> Option<f64> {
        self.link_latency_ms
    }

    pub fn udp_latency_ms(&self) -> Option<f64> {
        self.udp_latency_ms
    }

    pub fn timings(&self) -> PacketTimings {
        PacketTimings {
            udp_send_time_s: self.udp_send_time_s,
            link_send_time_s: self.link_send_time_s,
            link_latency_ms: self.link_latency_ms,
            udp_latency_ms: self.udp_latency_ms,
        }
    }

    pub fn send_time_s(&self, layer: Layer) -> Option<f64> {
        match layer {
            Layer::Udp => self.udp_send_time_s,
            Layer::Link => self.link_send_time_s,
        }
    }

    pub fn latency_ms(&self, layer: Layer) -> Option<f64> {
        match layer {
            Layer::Udp => self.udp_latency_ms,
            Layer::Link => self.link_latency_ms,
        }
    }

    pub fn was_sent(&self, layer: Layer) -> bool {
        self.send_time_s(layer).is_some()
    }

    pub fn was_received(&self, layer: Layer) -> bool {
        self.latency_ms(layer).is_some()
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

/// A record that failed at least one constraint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidRecord {
    pub sequence_number: u64,
    pub violations: Vec<Violation>,
}

/// Which records of a run are physically implausible, and why.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ValidityReport {
    pub total: usize,
    pub invalid: Vec<InvalidRecord>,
}

impl ValidityReport {
    pub fn from_records(records: &[PacketRecord]) -> Self {
        let invalid = records
            .iter()
            .filter(|r| !r.is_valid())
            .map(|r| InvalidRecord {
                sequence_number: r.sequence_number(),
                violations: r.violations().to_vec(),
            })
            .collect();
        Self {
            total: records.len(),
            invalid,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }

    pub fn invalid_count(&self) -> usize {
        self.invalid.len()
    }

    pub fn valid_count(&self) -> usize {
        self.total - self.invalid.len()
    }

    pub fn by_violation(&self) -> BTreeMap<Violation, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.invalid {
            for violation in &record.violations {
                *counts.entry(*violation).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Configuration plus the ordered packet records of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    config: RunConfig,
    records: Vec<PacketRecord>,
}

impl RunResult {
    /// Records are kept ordered by sequence number.
    pub fn new(config: RunConfig, mut records: Vec<PacketRecord>) -> Self {
        records.sort_by_key(|r| r.sequence_number());
        Self { config, records }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn records(&self) -> &[PacketRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn valid_records(&self) -> impl Iterator<Item = &PacketRecord> {
        self.records.iter().filter(|r| r.is_valid())
    }

    pub fn validity_report(&self) -> ValidityReport {
        ValidityReport::from_records(&self.records)
    }
}
