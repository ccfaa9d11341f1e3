use crate::config::{LinkConfig, RunConfig, TimeoutPolicy};
use serde::Deserialize;
use std::path::PathBuf;

/// A measurement profile loaded from TOML. Every field is optional and only
/// overrides the defaults it names.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RunProfile {
    pub run: RunOverride,
    pub timeouts: TimeoutOverride,
    pub link: LinkOverride,
    pub serial: SerialProfile,
    pub output: OutputProfile,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RunOverride {
    pub runtime_us: Option<u64>,
    pub payload_size_bytes: Option<u32>,
    pub interval_us: Option<u64>,
    pub distance_cm: Option<f64>,
    pub random_payload: Option<bool>,
}

impl RunOverride {
    pub fn apply_to(&self, config: &mut RunConfig) {
        if let Some(v) = self.runtime_us {
            config.runtime_us = v;
        }
        if let Some(v) = self.payload_size_bytes {
            config.payload_size_bytes = v;
        }
        if let Some(v) = self.interval_us {
            config.interval_us = v;
        }
        if let Some(v) = self.distance_cm {
            config.distance_cm = Some(v);
        }
        if let Some(v) = self.random_payload {
            config.random_payload = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutOverride {
    pub miss_factor: Option<u32>,
    pub sender_floor_ms: Option<u64>,
    pub receiver_floor_ms: Option<u64>,
}

impl TimeoutOverride {
    pub fn apply_to(&self, policy: &mut TimeoutPolicy) {
        if let Some(v) = self.miss_factor {
            policy.miss_factor = v;
        }
        if let Some(v) = self.sender_floor_ms {
            policy.sender_floor_ms = v;
        }
        if let Some(v) = self.receiver_floor_ms {
            policy.receiver_floor_ms = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LinkOverride {
    pub link_loss_rate: Option<f64>,
    pub udp_loss_rate: Option<f64>,
    pub corrupt_rate: Option<f64>,
    pub min_latency_us: Option<u64>,
    pub max_latency_us: Option<u64>,
    pub seed: Option<u64>,
    /// Sequence numbers the simulated link always loses.
    pub drop_sequences: Vec<u64>,
}

impl LinkOverride {
    pub fn apply_to(&self, config: &mut LinkConfig) {
        if let Some(v) = self.link_loss_rate {
            config.link_loss_rate = v;
        }
        if let Some(v) = self.udp_loss_rate {
            config.udp_loss_rate = v;
        }
        if let Some(v) = self.corrupt_rate {
            config.corrupt_rate = v;
        }
        if let Some(v) = self.min_latency_us {
            config.min_latency_us = v;
        }
        if let Some(v) = self.max_latency_us {
            config.max_latency_us = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SerialProfile {
    pub sender_port: Option<String>,
    pub receiver_port: Option<String>,
    pub baud_rate: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OutputProfile {
    pub directory: Option<PathBuf>,
    pub subfolder: Option<String>,
    pub note: Option<String>,
}
