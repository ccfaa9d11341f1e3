use thiserror::Error;
use vlc_lab_abstract::{EventKind, RawEvent, Timestamp};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("empty line")]
    Empty,
    #[error("unknown marker '{0}'")]
    UnknownMarker(String),
    #[error("marker '{0}' without packet number")]
    MissingSequence(EventKind),
    #[error("cannot parse packet number '{value}' of marker '{kind}'")]
    InvalidSequence { kind: EventKind, value: String },
}

/// Strip line endings and the node shell prompt (`> `) the firmware prints
/// once a command returns.
pub fn clean_line(raw: &str) -> &str {
    let line = raw.trim();
    match line.strip_prefix('>') {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

/// Parse one serial line captured at `timestamp`.
///
/// Packet markers need a non-negative packet number as second token; control
/// markers ignore anything after the marker.
pub fn parse_line(raw: &str, timestamp: Timestamp) -> Result<RawEvent, LineError> {
    let mut tokens = clean_line(raw).split_whitespace();
    let marker = tokens.next().ok_or(LineError::Empty)?;
    let kind = EventKind::from_marker(marker)
        .ok_or_else(|| LineError::UnknownMarker(marker.to_string()))?;

    let sequence_number = if kind.carries_sequence() {
        let value = tokens.next().ok_or(LineError::MissingSequence(kind))?;
        let number = value
            .parse::<u64>()
            .map_err(|_| LineError::InvalidSequence {
                kind,
                value: value.to_string(),
            })?;
        Some(number)
    } else {
        None
    };

    Ok(RawEvent {
        kind,
        sequence_number,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn parses_packet_markers() {
        let event = parse_line("su 17\n", at(3)).unwrap();
        assert_eq!(event.kind, EventKind::UdpSend);
        assert_eq!(event.sequence_number, Some(17));
        assert_eq!(event.timestamp, at(3));

        let event = parse_line("rl 0\r\n", at(4)).unwrap();
        assert_eq!(event.kind, EventKind::LinkReceive);
        assert_eq!(event.sequence_number, Some(0));
    }

    #[test]
    fn strips_shell_prompt() {
        let event = parse_line("> ru 5", at(0)).unwrap();
        assert_eq!(event.kind, EventKind::UdpReceive);
        assert_eq!(event.sequence_number, Some(5));
        assert_eq!(parse_line(">", at(0)), Err(LineError::Empty));
    }

    #[test]
    fn parses_bare_control_markers() {
        for (line, kind) in [
            ("rr", EventKind::Ready),
            ("Timeout", EventKind::Timeout),
            ("du", EventKind::Drop),
            ("fu", EventKind::SendFinished),
        ] {
            let event = parse_line(line, at(0)).unwrap();
            assert_eq!(event.kind, kind);
            assert_eq!(event.sequence_number, None);
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_line("   \n", at(0)), Err(LineError::Empty));
        assert_eq!(
            parse_line("All up, running the shell now", at(0)),
            Err(LineError::UnknownMarker("All".to_string()))
        );
        assert_eq!(
            parse_line("sl", at(0)),
            Err(LineError::MissingSequence(EventKind::LinkSend))
        );
        assert_eq!(
            parse_line("su -3", at(0)),
            Err(LineError::InvalidSequence {
                kind: EventKind::UdpSend,
                value: "-3".to_string()
            })
        );
        assert!(matches!(
            parse_line("ru 4x", at(0)),
            Err(LineError::InvalidSequence { .. })
        ));
    }
}
