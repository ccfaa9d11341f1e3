use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Parameters of one measurement run. Fixed when the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// How long the sending node keeps issuing packets.
    pub runtime_us: u64,
    /// UDP payload size.
    pub payload_size_bytes: u32,
    /// Delay between two send calls on the sending node.
    pub interval_us: u64,
    /// Physical distance between the two nodes, if it was recorded.
    pub distance_cm: Option<f64>,
    /// Random payloads disable the receiver's content check (`du` markers).
    pub random_payload: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            runtime_us: 10 * 1_000_000,
            payload_size_bytes: 100,
            interval_us: 1_000_000,
            distance_cm: None,
            random_payload: true,
        }
    }
}

impl RunConfig {
    pub fn runtime_s(&self) -> f64 {
        self.runtime_us as f64 / 1_000_000.0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }
}

/// Protocol layer a measurement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Transport layer (UDP socket on the nodes).
    Udp,
    /// Link layer of the light channel.
    Link,
}

impl Layer {
    pub const ALL: [Layer; 2] = [Layer::Udp, Layer::Link];

    pub fn name(&self) -> &'static str {
        match self {
            Layer::Udp => "udp",
            Layer::Link => "link",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read timeouts of the two listener streams.
///
/// A stream may stay silent for `miss_factor` send intervals before it is
/// considered finished. Short intervals are floored so a run does not end
/// before the nodes have even started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub miss_factor: u32,
    pub sender_floor_ms: u64,
    pub receiver_floor_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            miss_factor: 40,
            sender_floor_ms: 1_000,
            receiver_floor_ms: 5_000,
        }
    }
}

impl TimeoutPolicy {
    fn scaled(&self, config: &RunConfig, floor_ms: u64) -> Duration {
        let scaled = config
            .interval()
            .checked_mul(self.miss_factor)
            .unwrap_or(Duration::MAX);
        scaled.max(Duration::from_millis(floor_ms))
    }

    /// Idle timeout on the sending node's stream.
    pub fn sender_read_timeout(&self, config: &RunConfig) -> Duration {
        self.scaled(config, self.sender_floor_ms)
    }

    /// Idle timeout on the receiving node's stream. The same value is handed
    /// to the receiving node as its socket timeout.
    pub fn receiver_timeout(&self, config: &RunConfig) -> Duration {
        self.scaled(config, self.receiver_floor_ms)
    }
}

/// Per-packet protocol overhead added on top of the UDP payload when
/// estimating throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverheadModel {
    pub udp_overhead_bytes: u32,
    /// Link framing cost paid in addition to the transport overhead.
    pub link_extra_overhead_bytes: u32,
}

impl Default for OverheadModel {
    fn default() -> Self {
        Self {
            udp_overhead_bytes: 0,
            link_extra_overhead_bytes: 48,
        }
    }
}

impl OverheadModel {
    pub fn overhead_bytes(&self, layer: Layer) -> u32 {
        match layer {
            Layer::Udp => self.udp_overhead_bytes,
            Layer::Link => self.udp_overhead_bytes + self.link_extra_overhead_bytes,
        }
    }
}

/// Behaviour of the simulated light channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Probability that a frame never reaches the receiver's link layer.
    pub link_loss_rate: f64,
    /// Probability that a frame received on the link is lost before the UDP socket.
    pub udp_loss_rate: f64,
    /// Probability that a delivered payload fails the content check.
    pub corrupt_rate: f64,
    pub min_latency_us: u64,
    pub max_latency_us: u64,
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            link_loss_rate: 0.0,
            udp_loss_rate: 0.0,
            corrupt_rate: 0.0,
            min_latency_us: 20_000,
            max_latency_us: 60_000,
            seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_follow_interval_above_floor() {
        let policy = TimeoutPolicy::default();
        let config = RunConfig {
            interval_us: 250_000,
            ..Default::default()
        };
        assert_eq!(policy.sender_read_timeout(&config), Duration::from_secs(10));
        assert_eq!(policy.receiver_timeout(&config), Duration::from_secs(10));
    }

    #[test]
    fn short_intervals_are_floored() {
        let policy = TimeoutPolicy::default();
        let config = RunConfig {
            interval_us: 5_000,
            ..Default::default()
        };
        assert_eq!(policy.sender_read_timeout(&config), Duration::from_secs(1));
        assert_eq!(policy.receiver_timeout(&config), Duration::from_secs(5));
    }

    #[test]
    fn huge_intervals_saturate() {
        let policy = TimeoutPolicy::default();
        let config = RunConfig {
            interval_us: u64::MAX,
            ..Default::default()
        };
        assert_eq!(policy.sender_read_timeout(&config), Duration::MAX);
        assert_eq!(policy.receiver_timeout(&config), Duration::MAX);
    }

    #[test]
    fn link_overhead_includes_transport_overhead() {
        let model = OverheadModel {
            udp_overhead_bytes: 8,
            link_extra_overhead_bytes: 48,
        };
        assert_eq!(model.overhead_bytes(Layer::Udp), 8);
        assert_eq!(model.overhead_bytes(Layer::Link), 56);
    }
}
