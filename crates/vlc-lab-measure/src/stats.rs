//! Reliability, latency and throughput of a reconstructed run.
//!
//! Every function reads the records of a run and nothing else. Records count
//! whenever the fields a statistic needs are present, whether or not they are
//! flagged invalid; filter with [`RunResult::valid_records`] first to exclude
//! them.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use vlc_lab_abstract::{Layer, PacketRecord, RunResult};

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("no packets were sent at the {0} layer")]
    NoPacketsSent(Layer),
    #[error("bin size must be a positive number of seconds, got {0}")]
    InvalidBinSize(f64),
    #[error("percentile must lie within 0..=100, got {0}")]
    InvalidPercentile(f64),
    #[error("run has no runtime")]
    ZeroRuntime,
}

/// Sent and received packets of one layer. A packet only counts as received
/// if it was also seen leaving the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LayerCounts {
    pub sent: usize,
    pub received: usize,
}

pub fn counts(records: &[PacketRecord], layer: Layer) -> LayerCounts {
    records
        .iter()
        .filter(|r| r.was_sent(layer))
        .fold(LayerCounts::default(), |mut acc, r| {
            acc.sent += 1;
            if r.was_received(layer) {
                acc.received += 1;
            }
            acc
        })
}

/// `received / sent` at `layer`.
pub fn reliability(records: &[PacketRecord], layer: Layer) -> Result<f64, StatsError> {
    let LayerCounts { sent, received } = counts(records, layer);
    if sent == 0 {
        return Err(StatsError::NoPacketsSent(layer));
    }
    Ok(received as f64 / sent as f64)
}

/// Present latencies at `layer`, in record order.
pub fn latencies(records: &[PacketRecord], layer: Layer) -> Vec<f64> {
    records.iter().filter_map(|r| r.latency_ms(layer)).collect()
}

/// Mean over the present latencies only; `None` when there are none.
pub fn average_latency(records: &[PacketRecord], layer: Layer) -> Option<f64> {
    let values = latencies(records, layer);
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Latency at percentile `p` (linear interpolation between closest ranks).
pub fn latency_percentile(
    records: &[PacketRecord],
    layer: Layer,
    p: f64,
) -> Result<Option<f64>, StatsError> {
    if !(0.0..=100.0).contains(&p) {
        return Err(StatsError::InvalidPercentile(p));
    }
    let mut values = latencies(records, layer);
    values.sort_by(f64::total_cmp);
    Ok(percentile_of_sorted(&values, p))
}

fn percentile_of_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = p / 100.0 * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Sample standard deviation; absent for a single sample.
    pub std_dev_ms: Option<f64>,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
}

pub fn latency_summary(records: &[PacketRecord], layer: Layer) -> Option<LatencySummary> {
    let mut values = latencies(records, layer);
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let std_dev = (count > 1).then(|| {
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    });

    Some(LatencySummary {
        count,
        mean_ms: mean,
        min_ms: values[0],
        max_ms: values[count - 1],
        std_dev_ms: std_dev,
        p50_ms: percentile_of_sorted(&values, 50.0)?,
        p90_ms: percentile_of_sorted(&values, 90.0)?,
        p99_ms: percentile_of_sorted(&values, 99.0)?,
    })
}

/// Points for a latency-over-time plot.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct LatencyAxis {
    pub send_time_s: Vec<f64>,
    pub latency_ms: Vec<f64>,
}

/// `(send time, latency)` of every received packet at `layer`. With a
/// `limit_s`, collection stops at the first record whose link send time lies
/// beyond it.
pub fn latency_axis(records: &[PacketRecord], layer: Layer, limit_s: Option<f64>) -> LatencyAxis {
    let mut axis = LatencyAxis::default();
    for record in records {
        if let (Some(limit), Some(link_send)) = (limit_s, record.link_send_time_s())
            && link_send > limit
        {
            break;
        }
        if let (Some(sent), Some(latency)) = (record.send_time_s(layer), record.latency_ms(layer)) {
            axis.send_time_s.push(sent);
            axis.latency_ms.push(latency);
        }
    }
    axis
}

/// Packets sent within one time bin and how many of them arrived. Only bins
/// in which something was sent are reported; gaps are left to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityBin {
    pub index: i64,
    pub start_s: f64,
    pub sent: usize,
    pub received: usize,
}

impl ReliabilityBin {
    /// `None` only for a hand-built bin with nothing sent.
    pub fn reliability(&self) -> Option<f64> {
        (self.sent > 0).then(|| self.received as f64 / self.sent as f64)
    }
}

/// Reliability per `bin_size_s` window of each packet's own send time at
/// `layer`, in bin order. Only occupied bins are returned, so the output never
/// outgrows the input; records never sent at `layer` are left out.
pub fn binned_reliability(
    records: &[PacketRecord],
    layer: Layer,
    bin_size_s: f64,
) -> Result<Vec<ReliabilityBin>, StatsError> {
    if !(bin_size_s.is_finite() && bin_size_s > 0.0) {
        return Err(StatsError::InvalidBinSize(bin_size_s));
    }

    let mut occupied: BTreeMap<i64, (usize, usize)> = BTreeMap::new();
    for record in records {
        let Some(sent_at) = record.send_time_s(layer) else {
            continue;
        };
        let index = (sent_at / bin_size_s).floor() as i64;
        let (sent, received) = occupied.entry(index).or_default();
        *sent += 1;
        if record.was_received(layer) {
            *received += 1;
        }
    }

    Ok(occupied
        .into_iter()
        .map(|(index, (sent, received))| ReliabilityBin {
            index,
            start_s: index as f64 * bin_size_s,
            sent,
            received,
        })
        .collect())
}

/// Average goodput at `layer` in bit/s over the configured runtime, counting
/// `overhead_bytes` on top of every received payload.
pub fn throughput_bps(
    result: &RunResult,
    layer: Layer,
    overhead_bytes: u32,
) -> Result<f64, StatsError> {
    let config = result.config();
    if config.runtime_us == 0 {
        return Err(StatsError::ZeroRuntime);
    }
    let received = counts(result.records(), layer).received;
    let bits_per_packet = (u64::from(config.payload_size_bytes) + u64::from(overhead_bytes)) * 8;
    Ok((received as u64 * bits_per_packet) as f64 / config.runtime_s())
}
