use serde::Serialize;
use vlc_lab_abstract::{Layer, OverheadModel, RunConfig, RunResult, ValidityReport};

use crate::coordinator::Measurement;
use crate::listener::ListenerSummary;
use crate::stats::{
    LatencyAxis, LatencySummary, ReliabilityBin, StatsError, binned_reliability, counts,
    latency_axis, latency_summary, reliability, throughput_bps,
};

pub const DEFAULT_BIN_SIZE_S: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportOptions {
    pub bin_size_s: f64,
    pub overhead: OverheadModel,
    /// Include the per-packet latency series of each layer.
    pub latency_axes: bool,
    /// Cut the latency series at this link send time.
    pub axis_limit_s: Option<f64>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            bin_size_s: DEFAULT_BIN_SIZE_S,
            overhead: OverheadModel::default(),
            latency_axes: false,
            axis_limit_s: None,
        }
    }
}

/// Statistics of one layer. Ratios are absent when nothing was sent.
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub layer: Layer,
    pub sent: usize,
    pub received: usize,
    pub reliability: Option<f64>,
    pub latency: Option<LatencySummary>,
    pub overhead_bytes: u32,
    pub throughput_bps: Option<f64>,
    pub bins: Vec<ReliabilityBin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis: Option<LatencyAxis>,
}

impl LayerReport {
    fn build(result: &RunResult, layer: Layer, options: &ReportOptions) -> Result<Self, StatsError> {
        let records = result.records();
        let layer_counts = counts(records, layer);
        let overhead_bytes = options.overhead.overhead_bytes(layer);
        Ok(Self {
            layer,
            sent: layer_counts.sent,
            received: layer_counts.received,
            reliability: reliability(records, layer).ok(),
            latency: latency_summary(records, layer),
            overhead_bytes,
            throughput_bps: throughput_bps(result, layer, overhead_bytes).ok(),
            bins: binned_reliability(records, layer, options.bin_size_s)?,
            axis: options
                .latency_axes
                .then(|| latency_axis(records, layer, options.axis_limit_s)),
        })
    }
}

/// Serializable summary of a run, written next to the CSV by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: RunConfig,
    pub packets: usize,
    pub bin_size_s: f64,
    pub layers: Vec<LayerReport>,
    pub validity: ValidityReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<ListenerSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<ListenerSummary>,
}

impl RunReport {
    /// Fails only on an unusable bin size.
    pub fn build(result: &RunResult, options: &ReportOptions) -> Result<Self, StatsError> {
        let layers = Layer::ALL
            .into_iter()
            .map(|layer| LayerReport::build(result, layer, options))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config: result.config().clone(),
            packets: result.len(),
            bin_size_s: options.bin_size_s,
            layers,
            validity: result.validity_report(),
            sender: None,
            receiver: None,
        })
    }

    pub fn from_measurement(
        measurement: &Measurement,
        options: &ReportOptions,
    ) -> Result<Self, StatsError> {
        let mut report = Self::build(&measurement.result, options)?;
        report.sender = Some(measurement.sender.clone());
        report.receiver = Some(measurement.receiver.clone());
        Ok(report)
    }

    pub fn layer(&self, layer: Layer) -> Option<&LayerReport> {
        self.layers.iter().find(|l| l.layer == layer)
    }
}
