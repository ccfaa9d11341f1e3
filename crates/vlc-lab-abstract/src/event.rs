use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::Layer;

/// Which node a serial stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Serial output markers printed by the node firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `su <n>`: right before the UDP send call.
    UdpSend,
    /// `sl <n>`: link layer send started, payload assembled.
    LinkSend,
    /// `ru <n>`: packet handed to the receiving UDP socket.
    UdpReceive,
    /// `rl <n>`: link layer receive finished.
    LinkReceive,
    /// `du`: payload did not match and was dropped by the receiver.
    Drop,
    /// `rr`: receiver set up, sending may start.
    Ready,
    /// `Timeout`: receiver gave up waiting for packets.
    Timeout,
    /// `fu`: sender finished all send iterations.
    SendFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::UdpSend,
        EventKind::LinkSend,
        EventKind::UdpReceive,
        EventKind::LinkReceive,
        EventKind::Drop,
        EventKind::Ready,
        EventKind::Timeout,
        EventKind::SendFinished,
    ];

    pub fn marker(&self) -> &'static str {
        match self {
            EventKind::UdpSend => "su",
            EventKind::LinkSend => "sl",
            EventKind::UdpReceive => "ru",
            EventKind::LinkReceive => "rl",
            EventKind::Drop => "du",
            EventKind::Ready => "rr",
            EventKind::Timeout => "Timeout",
            EventKind::SendFinished => "fu",
        }
    }

    pub fn from_marker(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.marker() == token)
    }

    /// Packet events carry a sequence number, control events are bare.
    pub fn carries_sequence(&self) -> bool {
        self.layer().is_some()
    }

    /// The stream on which this marker is expected.
    pub fn role(&self) -> Role {
        match self {
            EventKind::UdpSend | EventKind::LinkSend | EventKind::SendFinished => Role::Sender,
            EventKind::UdpReceive
            | EventKind::LinkReceive
            | EventKind::Drop
            | EventKind::Ready
            | EventKind::Timeout => Role::Receiver,
        }
    }

    pub fn layer(&self) -> Option<Layer> {
        match self {
            EventKind::UdpSend | EventKind::UdpReceive => Some(Layer::Udp),
            EventKind::LinkSend | EventKind::LinkReceive => Some(Layer::Link),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Host-side capture instant, measured from the start of the run.
///
/// Both listeners share the same run epoch, so timestamps from the two
/// streams live on one time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    pub fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    /// Signed distance to an earlier instant in seconds. Negative when the
    /// "earlier" instant was actually captured later.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        self.as_secs_f64() - earlier.as_secs_f64()
    }
}

/// One parsed line of a listener stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    /// Absent for control markers.
    pub sequence_number: Option<u64>,
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_marker(kind.marker()), Some(kind));
        }
        assert_eq!(EventKind::from_marker("timeout"), None);
        assert_eq!(EventKind::from_marker(""), None);
    }

    #[test]
    fn packet_markers_carry_sequence() {
        assert!(EventKind::UdpSend.carries_sequence());
        assert!(EventKind::LinkReceive.carries_sequence());
        assert!(!EventKind::Ready.carries_sequence());
        assert!(!EventKind::Drop.carries_sequence());
        assert_eq!(EventKind::SendFinished.role(), Role::Sender);
        assert_eq!(EventKind::Timeout.role(), Role::Receiver);
    }

    #[test]
    fn seconds_since_is_signed() {
        let a = Timestamp::from_millis(1_500);
        let b = Timestamp::from_millis(500);
        assert!((a.seconds_since(b) - 1.0).abs() < 1e-12);
        assert!((b.seconds_since(a) + 1.0).abs() < 1e-12);
    }
}
