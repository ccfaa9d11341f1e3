use std::collections::BTreeMap;
use thiserror::Error;
use vlc_lab_abstract::{EventKind, RawEvent, Timestamp};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{kind}' event for packet {sequence_number} already recorded")]
pub struct DuplicateEvent {
    pub kind: EventKind,
    pub sequence_number: u64,
}

/// Capture times of one stream's packet events, per marker kind and keyed by
/// packet number. Append-only: the first capture of a `(kind, packet)` pair
/// wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    events: BTreeMap<EventKind, BTreeMap<u64, Timestamp>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        kind: EventKind,
        sequence_number: u64,
        timestamp: Timestamp,
    ) -> Result<(), DuplicateEvent> {
        debug_assert!(kind.carries_sequence(), "control marker {kind} stored");
        let per_kind = self.events.entry(kind).or_default();
        if per_kind.contains_key(&sequence_number) {
            return Err(DuplicateEvent {
                kind,
                sequence_number,
            });
        }
        per_kind.insert(sequence_number, timestamp);
        Ok(())
    }

    /// Store a parsed packet event. Control events carry no packet number and
    /// are ignored.
    pub fn record(&mut self, event: &RawEvent) -> Result<bool, DuplicateEvent> {
        match event.sequence_number {
            Some(seq) if event.kind.carries_sequence() => {
                self.insert(event.kind, seq, event.timestamp)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn get(&self, kind: EventKind, sequence_number: u64) -> Option<Timestamp> {
        self.events.get(&kind)?.get(&sequence_number).copied()
    }

    pub fn contains(&self, kind: EventKind, sequence_number: u64) -> bool {
        self.get(kind, sequence_number).is_some()
    }

    pub fn max_sequence(&self, kind: EventKind) -> Option<u64> {
        self.events.get(&kind)?.keys().next_back().copied()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.events.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packet numbers seen for `kind`, ascending.
    pub fn sequences(&self, kind: EventKind) -> impl Iterator<Item = u64> + '_ {
        self.events
            .get(&kind)
            .into_iter()
            .flat_map(|per_kind| per_kind.keys().copied())
    }
}
