//! Semicolon separated run files.
//!
//! ```text
//! Runtime in us;10000000
//! Payload size in byte;100
//! Interval in us;1000000
//! Distance in cm;150          (optional)
//!
//! pkt number;rel. UDP pkt send time [s];...
//! 0;0;0.0012;40.3;41.1
//! 1;1.0001;-1;-1;-1
//! ```
//!
//! `-1` marks an event that never happened. It never reaches the record
//! model, which uses `None` instead.

use chrono::{Local, NaiveDateTime};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};
use vlc_lab_abstract::{PacketRecord, PacketTimings, RunConfig, RunResult};

const RUNTIME_LABEL: &str = "Runtime in us";
const PAYLOAD_LABEL: &str = "Payload size in byte";
const INTERVAL_LABEL: &str = "Interval in us";
const DISTANCE_LABEL: &str = "Distance in cm";
const COLUMN_HEADER: &str = "pkt number;rel. UDP pkt send time [s];rel. link pkt send time [s];Latency link [ms];Latency UDP [ms]";
const ABSENT: &str = "-1";
const ABSENT_VALUE: f64 = -1.0;
const FIELDS_PER_RECORD: usize = 5;

pub const DEFAULT_SUBFOLDER: &str = "latency";

/// Line numbers are 1-based.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cannot access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: file ends before the {expected}")]
    Truncated { line: usize, expected: &'static str },
    #[error("line {line}: invalid {field} '{value}'")]
    InvalidHeader {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },
}

/// Render a run in the semicolon file format. The format has no field for
/// `random_payload`, so decoding the output restores the records and every
/// other config field but reports that flag as set.
pub fn encode(result: &RunResult) -> String {
    let config = result.config();
    let mut out = String::new();

    // writing into a String cannot fail
    let _ = writeln!(out, "{RUNTIME_LABEL};{}", config.runtime_us);
    let _ = writeln!(out, "{PAYLOAD_LABEL};{}", config.payload_size_bytes);
    let _ = writeln!(out, "{INTERVAL_LABEL};{}", config.interval_us);
    if let Some(distance) = config.distance_cm {
        let _ = writeln!(out, "{DISTANCE_LABEL};{distance}");
    }
    out.push('\n');
    out.push_str(COLUMN_HEADER);
    out.push('\n');

    for record in result.records() {
        let _ = writeln!(
            out,
            "{};{};{};{};{}",
            record.sequence_number(),
            field(record.udp_send_time_s()),
            field(record.link_send_time_s()),
            field(record.link_latency_ms()),
            field(record.udp_latency_ms()),
        );
    }
    out
}

fn field(value: Option<f64>) -> String {
    value.map_or_else(|| ABSENT.to_string(), |v| v.to_string())
}

struct Lines<'a> {
    inner: std::iter::Enumerate<std::str::Lines<'a>>,
    last: usize,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.lines().enumerate(),
            last: 0,
        }
    }

    fn next(&mut self, expected: &'static str) -> Result<(usize, &'a str), CodecError> {
        match self.inner.next() {
            Some((index, line)) => {
                self.last = index + 1;
                Ok((index + 1, line.trim_end()))
            }
            None => Err(CodecError::Truncated {
                line: self.last + 1,
                expected,
            }),
        }
    }

    fn header<T: FromStr>(
        &mut self,
        label: &'static str,
        field: &'static str,
    ) -> Result<T, CodecError> {
        let (number, line) = self.next(field)?;
        header_value(number, line, label, field)
    }

    fn rest(self) -> impl Iterator<Item = (usize, &'a str)> {
        self.inner.map(|(index, line)| (index + 1, line.trim_end()))
    }
}

fn header_value<T: FromStr>(
    line: usize,
    text: &str,
    label: &'static str,
    field: &'static str,
) -> Result<T, CodecError> {
    let invalid = || CodecError::InvalidHeader {
        line,
        field,
        value: text.to_string(),
    };
    let (found, value) = text.split_once(';').ok_or_else(invalid)?;
    if found.trim() != label {
        return Err(invalid());
    }
    value.trim().parse().map_err(|_| invalid())
}

/// Parse a whole run file. Any malformed line fails the load. The returned
/// config always has `random_payload` set (see [`encode`]).
pub fn decode(text: &str) -> Result<RunResult, CodecError> {
    let mut lines = Lines::new(text);

    let runtime_us = lines.header(RUNTIME_LABEL, "runtime")?;
    let payload_size_bytes = lines.header(PAYLOAD_LABEL, "payload size")?;
    let interval_us = lines.header(INTERVAL_LABEL, "interval")?;

    let distance_cm = match lines.next("blank separator line")? {
        (_, "") => None,
        (number, line) => {
            let distance = distance_value(number, line)?;
            match lines.next("blank separator line")? {
                (_, "") => {}
                (number, line) => {
                    return Err(CodecError::InvalidHeader {
                        line: number,
                        field: "separator",
                        value: line.to_string(),
                    });
                }
            }
            distance
        }
    };

    // the label text varies between tool versions; only its presence matters
    let (number, column_header) = lines.next("column header")?;
    if column_header.is_empty() {
        return Err(CodecError::InvalidHeader {
            line: number,
            field: "column header",
            value: String::new(),
        });
    }

    let records = lines
        .rest()
        .map(|(number, line)| decode_record(number, line))
        .collect::<Result<Vec<_>, _>>()?;

    let config = RunConfig {
        runtime_us,
        payload_size_bytes,
        interval_us,
        distance_cm,
        // files do not store the flag; every recorded run used random payloads
        random_payload: true,
    };
    Ok(RunResult::new(config, records))
}

/// A distance line with an empty value counts as "not recorded".
fn distance_value(line: usize, text: &str) -> Result<Option<f64>, CodecError> {
    match text.split_once(';') {
        Some((label, value)) if label.trim() == DISTANCE_LABEL && value.trim().is_empty() => {
            Ok(None)
        }
        _ => header_value(line, text, DISTANCE_LABEL, "distance").map(Some),
    }
}

fn decode_record(line: usize, text: &str) -> Result<PacketRecord, CodecError> {
    let fields: Vec<&str> = text.split(';').map(str::trim).collect();
    if fields.len() != FIELDS_PER_RECORD {
        return Err(CodecError::InvalidRecord {
            line,
            reason: format!(
                "expected {FIELDS_PER_RECORD} fields, found {}",
                fields.len()
            ),
        });
    }

    let sequence_number = fields[0]
        .parse::<u64>()
        .map_err(|_| CodecError::InvalidRecord {
            line,
            reason: format!("invalid packet number '{}'", fields[0]),
        })?;
    let value = |index: usize| -> Result<Option<f64>, CodecError> {
        let raw = fields[index];
        match raw.parse::<f64>() {
            Ok(v) if v == ABSENT_VALUE => Ok(None),
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(CodecError::InvalidRecord {
                line,
                reason: format!("invalid value '{raw}' in column {}", index + 1),
            }),
        }
    };

    Ok(PacketRecord::new(
        sequence_number,
        PacketTimings {
            udp_send_time_s: value(1)?,
            link_send_time_s: value(2)?,
            link_latency_ms: value(3)?,
            udp_latency_ms: value(4)?,
        },
    ))
}

/// `latency_<timestamp>_<payload>b_over<s>s_every<ms>ms[_<note>].csv`
pub fn file_name(config: &RunConfig, note: Option<&str>, now: NaiveDateTime) -> String {
    let mut name = format!(
        "latency_{}_{}b_over{}s_every{}ms",
        now.format("%Y-%m-%dT%H-%M-%S"),
        config.payload_size_bytes,
        config.runtime_us / 1_000_000,
        config.interval_us / 1_000,
    );
    if let Some(note) = note.filter(|n| !n.is_empty()) {
        name.push('_');
        name.push_str(note);
    }
    name.push_str(".csv");
    name
}

/// Write the run under `<dir>/<subfolder>/` and return the file path.
pub fn save(
    result: &RunResult,
    dir: &Path,
    subfolder: &str,
    note: Option<&str>,
) -> Result<PathBuf, CodecError> {
    let folder = dir.join(subfolder);
    std::fs::create_dir_all(&folder).map_err(|source| CodecError::Io {
        path: folder.clone(),
        source,
    })?;

    let path = folder.join(file_name(result.config(), note, Local::now().naive_local()));
    std::fs::write(&path, encode(result)).map_err(|source| CodecError::Io {
        path: path.clone(),
        source,
    })?;
    info!("Saved measurement in file: {}", path.display());
    Ok(path)
}

/// Read a run file. Invalid records are logged and kept.
pub fn load(path: &Path) -> Result<RunResult, CodecError> {
    let text = std::fs::read_to_string(path).map_err(|source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let result = decode(&text)?;
    for record in result.records().iter().filter(|r| !r.is_valid()) {
        warn!(
            "Package {} not valid: {:?}",
            record.sequence_number(),
            record.violations()
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use vlc_lab_abstract::Layer;

    fn sample(distance_cm: Option<f64>) -> RunResult {
        let config = RunConfig {
            runtime_us: 3_000_000,
            payload_size_bytes: 64,
            interval_us: 500_000,
            distance_cm,
            random_payload: true,
        };
        let records = vec![
            PacketRecord::new(
                0,
                PacketTimings {
                    udp_send_time_s: Some(0.0),
                    link_send_time_s: Some(0.0012),
                    link_latency_ms: Some(40.25),
                    udp_latency_ms: Some(41.5),
                },
            ),
            PacketRecord::new(
                1,
                PacketTimings {
                    udp_send_time_s: Some(0.5003),
                    link_send_time_s: Some(0.5015),
                    link_latency_ms: Some(39.0),
                    udp_latency_ms: None,
                },
            ),
            PacketRecord::lost_before_send(2),
        ];
        RunResult::new(config, records)
    }

    #[test]
    fn encoded_layout() {
        let text = encode(&sample(Some(150.0)));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Runtime in us;3000000");
        assert_eq!(lines[1], "Payload size in byte;64");
        assert_eq!(lines[2], "Interval in us;500000");
        assert_eq!(lines[3], "Distance in cm;150");
        assert_eq!(lines[4], "");
        assert_eq!(lines[5], COLUMN_HEADER);
        assert_eq!(lines[7], "1;0.5003;0.5015;39;-1");
        assert_eq!(lines[8], "2;-1;-1;-1;-1");
    }

    #[test]
    fn decode_restores_records_and_absence() {
        for distance in [None, Some(87.5)] {
            let original = sample(distance);
            let decoded = decode(&encode(&original)).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn decodes_historical_file() {
        let text = "Runtime in us;2000000\r\n\
                    Payload size in byte;100\r\n\
                    Interval in us;1000000\r\n\
                    \r\n\
                    pkt number;rel. UDP pkt send time [s];rel. link pkt send time [s];Latency UDP [ms];Latency link [ms]\r\n\
                    0;0.0;0.00105;40.1;41.0\r\n\
                    1;1.0002;1.0013;-1;-1\r\n";
        let result = decode(text).unwrap();
        assert_eq!(result.config().runtime_us, 2_000_000);
        assert_eq!(result.config().distance_cm, None);
        assert!(result.config().random_payload);
        assert_eq!(result.len(), 2);
        assert_eq!(result.records()[1].link_latency_ms(), None);
        assert_eq!(result.records()[0].udp_latency_ms(), Some(41.0));
    }

    #[test]
    fn absence_is_read_by_value() {
        let text = "Runtime in us;1000000\nPayload size in byte;10\nInterval in us;500000\n\nheader\n\
                    0;0.0;0.001;-1.0;-1.00\n\
                    1;0.5;0.501;-1.5;-1e0\n";
        let result = decode(text).unwrap();
        let lost = &result.records()[0];
        assert_eq!(lost.link_latency_ms(), None);
        assert_eq!(lost.udp_latency_ms(), None);
        assert!(!lost.was_received(Layer::Link));
        assert!(!lost.was_received(Layer::Udp));
        // only exactly -1 means absent
        assert_eq!(result.records()[1].link_latency_ms(), Some(-1.5));
        assert_eq!(result.records()[1].udp_latency_ms(), None);
    }

    #[test]
    fn fixed_payload_flag_is_not_stored() {
        let mut config = sample(None).config().clone();
        config.random_payload = false;
        let original = RunResult::new(config, sample(None).records().to_vec());
        let decoded = decode(&encode(&original)).unwrap();
        assert!(decoded.config().random_payload);
        assert_eq!(decoded.records(), original.records());
        assert_eq!(decoded.config().runtime_us, original.config().runtime_us);
        assert_eq!(decoded.config().interval_us, original.config().interval_us);
    }

    #[test]
    fn empty_distance_value_means_not_recorded() {
        let text = "Runtime in us;1\nPayload size in byte;2\nInterval in us;3\nDistance in cm;\n\nheader\n0;0;0;-1;-1\n";
        let result = decode(text).unwrap();
        assert_eq!(result.config().distance_cm, None);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn truncated_header_fails_the_load() {
        let err = decode("Runtime in us;1000000\nPayload size in byte;100\n").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                line: 3,
                expected: "interval"
            }
        ));

        let err = decode("Runtime in us;1\nPayload size in byte;2\nInterval in us;3\n\n")
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: "column header",
                ..
            }
        ));
    }

    #[test]
    fn invalid_header_values_are_reported() {
        let err = decode("Runtime in us;ten\n").unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidHeader {
                line: 1,
                field: "runtime",
                ..
            }
        ));

        let err = decode("Payload size in byte;100\n").unwrap_err();
        assert!(matches!(err, CodecError::InvalidHeader { line: 1, .. }));

        let err =
            decode("Runtime in us;1\nPayload size in byte;2\nInterval in us;3\nDistance in cm;far\n")
                .unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidHeader {
                line: 4,
                field: "distance",
                ..
            }
        ));
    }

    #[test]
    fn any_bad_record_fails_the_whole_load() {
        let mut text = encode(&sample(None));
        text.push_str("3;1.5;1.5;40\n");
        let err = decode(&text).unwrap_err();
        assert!(matches!(err, CodecError::InvalidRecord { line: 9, .. }));

        let mut text = encode(&sample(None));
        text.push_str("3;1.5;x;40;41\n");
        assert!(matches!(
            decode(&text),
            Err(CodecError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn file_name_format() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap();
        let config = sample(None).config().clone();
        assert_eq!(
            file_name(&config, None, now),
            "latency_2024-03-07T14-05-09_64b_over3s_every500ms.csv"
        );
        assert_eq!(
            file_name(&config, Some("door_open"), now),
            "latency_2024-03-07T14-05-09_64b_over3s_every500ms_door_open.csv"
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample(Some(20.0));
        let path = save(&original, dir.path(), DEFAULT_SUBFOLDER, Some("bench")).unwrap();
        assert!(path.starts_with(dir.path().join(DEFAULT_SUBFOLDER)));
        assert!(path.to_string_lossy().ends_with("_bench.csv"));
        assert_eq!(load(&path).unwrap(), original);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, CodecError::Io { .. }));
    }
}
