use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::{Path, PathBuf};
use vlc_lab_abstract::{
    LinkConfig, OutputProfile, OverheadModel, RunConfig, RunProfile, SerialProfile, TimeoutPolicy,
};
use vlc_lab_measure::ReportOptions;
use vlc_lab_measure::codec::DEFAULT_SUBFOLDER;
use vlc_lab_measure::report::DEFAULT_BIN_SIZE_S;

pub const DEFAULT_SENDER_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_RECEIVER_PORT: &str = "/dev/ttyACM1";
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// No path means the built-in defaults.
pub fn load_profile(path: Option<&Path>) -> Result<RunProfile> {
    let Some(path) = path else {
        return Ok(RunProfile::default());
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    let profile: RunProfile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse profile {}", path.display()))?;
    Ok(profile)
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunFlags {
    /// How long the sending node keeps sending, in microseconds.
    #[arg(long)]
    pub runtime_us: Option<u64>,
    /// UDP payload size in bytes.
    #[arg(long)]
    pub payload_size: Option<u32>,
    /// Delay between two packets, in microseconds.
    #[arg(long)]
    pub interval_us: Option<u64>,
    /// Distance between the nodes, stored with the run.
    #[arg(long)]
    pub distance_cm: Option<f64>,
    /// Send a fixed payload so the receiver drops corrupted packets.
    #[arg(long, default_value_t = false)]
    pub fixed_payload: bool,
    /// Intervals without input before a stream counts as finished.
    #[arg(long)]
    pub miss_factor: Option<u32>,
}

impl RunFlags {
    pub fn apply_to(&self, config: &mut RunConfig, timeouts: &mut TimeoutPolicy) {
        if let Some(v) = self.runtime_us {
            config.runtime_us = v;
        }
        if let Some(v) = self.payload_size {
            config.payload_size_bytes = v;
        }
        if let Some(v) = self.interval_us {
            config.interval_us = v;
        }
        if let Some(v) = self.distance_cm {
            config.distance_cm = Some(v);
        }
        if self.fixed_payload {
            config.random_payload = false;
        }
        if let Some(v) = self.miss_factor {
            timeouts.miss_factor = v;
        }
    }
}

/// Defaults, then the profile, then the command line.
pub fn resolve_run(profile: &RunProfile, flags: &RunFlags) -> (RunConfig, TimeoutPolicy) {
    let mut config = RunConfig::default();
    let mut timeouts = TimeoutPolicy::default();
    profile.run.apply_to(&mut config);
    profile.timeouts.apply_to(&mut timeouts);
    flags.apply_to(&mut config, &mut timeouts);
    (config, timeouts)
}

#[derive(Args, Debug, Clone, Default)]
pub struct SerialFlags {
    /// Serial port of the sending node.
    #[arg(long)]
    pub sender_port: Option<String>,
    /// Serial port of the receiving node.
    #[arg(long)]
    pub receiver_port: Option<String>,
    #[arg(long)]
    pub baud: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub sender_port: String,
    pub receiver_port: String,
    pub baud_rate: u32,
}

impl SerialSettings {
    pub fn resolve(profile: &SerialProfile, flags: &SerialFlags) -> Self {
        let pick = |flag: &Option<String>, profile: &Option<String>, default: &str| {
            flag.clone()
                .or_else(|| profile.clone())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            sender_port: pick(&flags.sender_port, &profile.sender_port, DEFAULT_SENDER_PORT),
            receiver_port: pick(
                &flags.receiver_port,
                &profile.receiver_port,
                DEFAULT_RECEIVER_PORT,
            ),
            baud_rate: flags.baud.or(profile.baud_rate).unwrap_or(DEFAULT_BAUD_RATE),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct LinkFlags {
    /// Probability that a frame is lost on the light link.
    #[arg(long)]
    pub link_loss: Option<f64>,
    /// Probability that a received frame never reaches the UDP socket.
    #[arg(long)]
    pub udp_loss: Option<f64>,
    /// Probability that a payload arrives corrupted.
    #[arg(long)]
    pub corrupt: Option<f64>,
    #[arg(long)]
    pub min_latency_us: Option<u64>,
    #[arg(long)]
    pub max_latency_us: Option<u64>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Packet number the link always loses (repeatable).
    #[arg(long = "drop")]
    pub drops: Vec<u64>,
}

impl LinkFlags {
    pub fn apply_to(&self, link: &mut LinkConfig, drops: &mut Vec<u64>) {
        if let Some(v) = self.link_loss {
            link.link_loss_rate = v;
        }
        if let Some(v) = self.udp_loss {
            link.udp_loss_rate = v;
        }
        if let Some(v) = self.corrupt {
            link.corrupt_rate = v;
        }
        if let Some(v) = self.min_latency_us {
            link.min_latency_us = v;
        }
        if let Some(v) = self.max_latency_us {
            link.max_latency_us = v;
        }
        if let Some(v) = self.seed {
            link.seed = v;
        }
        drops.extend(&self.drops);
    }
}

pub fn resolve_link(profile: &RunProfile, flags: &LinkFlags) -> (LinkConfig, Vec<u64>) {
    let mut link = LinkConfig::default();
    let mut drops = profile.link.drop_sequences.clone();
    profile.link.apply_to(&mut link);
    flags.apply_to(&mut link, &mut drops);
    (link, drops)
}

#[derive(Args, Debug, Clone, Default)]
pub struct OutputFlags {
    /// Store the run as CSV below this directory.
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
    #[arg(long)]
    pub subfolder: Option<String>,
    /// Appended to the CSV file name.
    #[arg(long)]
    pub note: Option<String>,
    /// Write a JSON report of the run.
    #[arg(long)]
    pub report_out: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub directory: Option<PathBuf>,
    pub subfolder: String,
    pub note: Option<String>,
    pub report_out: Option<PathBuf>,
}

impl OutputSettings {
    pub fn resolve(profile: &OutputProfile, flags: &OutputFlags) -> Self {
        Self {
            directory: flags.out_dir.clone().or_else(|| profile.directory.clone()),
            subfolder: flags
                .subfolder
                .clone()
                .or_else(|| profile.subfolder.clone())
                .unwrap_or_else(|| DEFAULT_SUBFOLDER.to_string()),
            note: flags.note.clone().or_else(|| profile.note.clone()),
            report_out: flags.report_out.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AnalysisFlags {
    /// Width of the reliability time bins in seconds.
    #[arg(long, default_value_t = DEFAULT_BIN_SIZE_S)]
    pub bin_size_s: f64,
    /// Per-packet transport overhead counted for throughput.
    #[arg(long, default_value_t = 0)]
    pub udp_overhead: u32,
    /// Link framing overhead on top of the transport overhead.
    #[arg(long, default_value_t = 48)]
    pub link_extra_overhead: u32,
    /// Put the per-packet latency series into the report.
    #[arg(long, default_value_t = false)]
    pub latency_axes: bool,
    /// Stop the latency series at this send time in seconds.
    #[arg(long)]
    pub axis_limit_s: Option<f64>,
}

impl AnalysisFlags {
    pub fn report_options(&self) -> ReportOptions {
        ReportOptions {
            bin_size_s: self.bin_size_s,
            overhead: OverheadModel {
                udp_overhead_bytes: self.udp_overhead,
                link_extra_overhead_bytes: self.link_extra_overhead,
            },
            latency_axes: self.latency_axes,
            axis_limit_s: self.axis_limit_s,
        }
    }
}
