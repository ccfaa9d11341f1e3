//! Merge the two frozen event tables into per-packet records.

use thiserror::Error;
use tracing::{debug, warn};
use vlc_lab_abstract::{EventKind, PacketRecord, PacketTimings, RunConfig, RunResult, Timestamp};

use crate::table::EventTable;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("UDP packet 0 was never sent, no relative time axis for this run")]
pub struct MissingAnchor;

/// Capture time of packet 0's UDP send. Every relative time of the run is
/// measured from it.
pub fn anchor(send_events: &EventTable) -> Option<Timestamp> {
    send_events.get(EventKind::UdpSend, 0)
}

/// One record per packet number in `0..=max UDP send number`, whether or not
/// the packet left the sender. Lookups go purely by packet number; the order
/// in which lines arrived is irrelevant.
pub fn reconstruct(
    send_events: &EventTable,
    receive_events: &EventTable,
    anchor: Timestamp,
) -> Vec<PacketRecord> {
    let Some(last) = send_events.max_sequence(EventKind::UdpSend) else {
        return Vec::new();
    };

    (0..=last)
        .map(|seq| reconstruct_packet(seq, send_events, receive_events, anchor))
        .collect()
}

fn reconstruct_packet(
    seq: u64,
    send_events: &EventTable,
    receive_events: &EventTable,
    anchor: Timestamp,
) -> PacketRecord {
    let udp_send = send_events.get(EventKind::UdpSend, seq);
    let link_send = send_events.get(EventKind::LinkSend, seq);
    let udp_receive = receive_events.get(EventKind::UdpReceive, seq);
    let link_receive = receive_events.get(EventKind::LinkReceive, seq);

    PacketRecord::new(
        seq,
        PacketTimings {
            udp_send_time_s: udp_send.map(|t| t.seconds_since(anchor)),
            // link times share the UDP anchor so both layers use one axis
            link_send_time_s: link_send.map(|t| t.seconds_since(anchor)),
            link_latency_ms: latency_ms(link_send, link_receive),
            udp_latency_ms: latency_ms(udp_send, udp_receive),
        },
    )
}

fn latency_ms(sent: Option<Timestamp>, received: Option<Timestamp>) -> Option<f64> {
    Some(received?.seconds_since(sent?) * 1000.0)
}

/// Packet numbers beyond this multiple of the configured packet count point
/// at a garbled serial line rather than a long run.
const PLAUSIBLE_SEQUENCE_FACTOR: u64 = 2;

/// Whether `last` is far beyond what `config` can have sent.
pub fn implausible_sequence(config: &RunConfig, last: u64) -> bool {
    let expected = config.runtime_us.div_ceil(config.interval_us.max(1));
    last > expected.saturating_mul(PLAUSIBLE_SEQUENCE_FACTOR).saturating_add(1)
}

/// Build the run result, or fail when packet 0 has no UDP send capture.
/// Invalid records are logged and kept.
pub fn reconstruct_run(
    config: RunConfig,
    send_events: &EventTable,
    receive_events: &EventTable,
) -> Result<RunResult, MissingAnchor> {
    let anchor = anchor(send_events).ok_or(MissingAnchor)?;
    let last = send_events.max_sequence(EventKind::UdpSend).unwrap_or(0);
    if implausible_sequence(&config, last) {
        warn!(
            "Highest UDP packet number {} is far above the {} us / {} us run, records are built up to it",
            last, config.runtime_us, config.interval_us
        );
    }
    let records = reconstruct(send_events, receive_events, anchor);

    for record in records.iter().filter(|r| !r.is_valid()) {
        for violation in record.violations() {
            warn!("Package {} not valid: {}", record.sequence_number(), violation);
        }
    }
    debug!("Reconstructed {} packet records", records.len());

    Ok(RunResult::new(config, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlc_lab_abstract::{Layer, Violation};

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn insert(table: &mut EventTable, kind: EventKind, seq: u64, at: u64) {
        table.insert(kind, seq, ms(at)).unwrap();
    }

    /// Packets every 100 ms starting at 1 s; link start 2 ms after the UDP call,
    /// link delivery after 40 ms, UDP delivery 1 ms later.
    fn tables(count: u64, udp_lost: &[u64], link_lost: &[u64]) -> (EventTable, EventTable) {
        let mut send = EventTable::new();
        let mut receive = EventTable::new();
        for seq in 0..count {
            let t = 1_000 + seq * 100;
            insert(&mut send, EventKind::UdpSend, seq, t);
            insert(&mut send, EventKind::LinkSend, seq, t + 2);
            if !link_lost.contains(&seq) {
                insert(&mut receive, EventKind::LinkReceive, seq, t + 42);
                if !udp_lost.contains(&seq) {
                    insert(&mut receive, EventKind::UdpReceive, seq, t + 43);
                }
            }
        }
        (send, receive)
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn relative_times_and_latencies() {
        let (send, receive) = tables(3, &[], &[]);
        let result = reconstruct_run(RunConfig::default(), &send, &receive).unwrap();
        assert_eq!(result.len(), 3);

        let second = &result.records()[1];
        assert_eq!(second.sequence_number(), 1);
        assert!(close(second.udp_send_time_s(), 0.1));
        assert!(close(second.link_send_time_s(), 0.102));
        assert!(close(second.link_latency_ms(), 40.0));
        assert!(close(second.udp_latency_ms(), 41.0));
        assert!(result.validity_report().is_clean());
    }

    #[test]
    fn lost_packets_have_absent_fields() {
        let (send, receive) = tables(5, &[2, 4], &[]);
        let result = reconstruct_run(RunConfig::default(), &send, &receive).unwrap();
        let records = result.records();
        assert_eq!(records[2].udp_latency_ms(), None);
        assert!(records[2].was_received(Layer::Link));
        assert!(records[4].was_sent(Layer::Udp));
        assert!(records.iter().all(|r| r.is_valid()));
    }

    #[test]
    fn missing_anchor_fails_the_run() {
        let (_, receive) = tables(3, &[], &[]);
        let mut send = EventTable::new();
        insert(&mut send, EventKind::LinkSend, 0, 1_002);
        insert(&mut send, EventKind::UdpSend, 1, 1_100);
        insert(&mut send, EventKind::UdpSend, 2, 1_200);
        assert_eq!(
            reconstruct_run(RunConfig::default(), &send, &receive),
            Err(MissingAnchor)
        );
    }

    #[test]
    fn gaps_become_all_absent_records() {
        let mut send = EventTable::new();
        insert(&mut send, EventKind::UdpSend, 0, 10);
        insert(&mut send, EventKind::UdpSend, 3, 40);
        let receive = EventTable::new();

        let records = reconstruct(&send, &receive, ms(10));
        assert_eq!(records.len(), 4);
        assert_eq!(records[1], PacketRecord::lost_before_send(1));
        assert_eq!(records[2], PacketRecord::lost_before_send(2));
        assert!(close(records[3].udp_send_time_s(), 0.03));
    }

    #[test]
    fn garbled_packet_numbers_are_implausible() {
        let config = RunConfig {
            runtime_us: 10_000_000,
            interval_us: 1_000_000,
            ..Default::default()
        };
        assert!(!implausible_sequence(&config, 9));
        assert!(!implausible_sequence(&config, 21));
        assert!(implausible_sequence(&config, 22));
        assert!(implausible_sequence(&config, u64::from(u32::MAX)));
    }

    #[test]
    fn events_past_last_udp_send_are_ignored() {
        let mut send = EventTable::new();
        insert(&mut send, EventKind::UdpSend, 0, 0);
        insert(&mut send, EventKind::LinkSend, 0, 1);
        insert(&mut send, EventKind::LinkSend, 1, 101);
        let records = reconstruct(&send, &EventTable::new(), ms(0));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn inverted_capture_order_is_flagged_not_corrected() {
        let mut send = EventTable::new();
        let mut receive = EventTable::new();
        insert(&mut send, EventKind::UdpSend, 0, 100);
        insert(&mut send, EventKind::UdpSend, 1, 200);
        // link line of packet 1 reached the host before its udp line
        insert(&mut send, EventKind::LinkSend, 1, 195);
        insert(&mut receive, EventKind::LinkReceive, 1, 260);
        insert(&mut receive, EventKind::UdpReceive, 1, 250);

        let result = reconstruct_run(RunConfig::default(), &send, &receive).unwrap();
        let record = &result.records()[1];
        assert_eq!(
            record.violations(),
            &[
                Violation::LinkSendBeforeUdpSend,
                Violation::LinkLatencyExceedsUdp
            ]
        );
        assert!(close(record.link_send_time_s(), 0.095));
        assert_eq!(result.validity_report().invalid_count(), 1);
    }

    #[test]
    fn receive_without_send_yields_no_latency() {
        let mut send = EventTable::new();
        let mut receive = EventTable::new();
        insert(&mut send, EventKind::UdpSend, 0, 0);
        insert(&mut send, EventKind::UdpSend, 1, 100);
        insert(&mut receive, EventKind::UdpReceive, 1, 150);

        let records = reconstruct(&send, &receive, ms(0));
        // udp latency present but nothing at link layer
        assert!(close(records[1].udp_latency_ms(), 50.0));
        assert_eq!(records[1].link_latency_ms(), None);
        assert!(!records[1].is_valid());
    }
}
