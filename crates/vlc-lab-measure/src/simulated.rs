//! Two emulated testbed nodes joined by a lossy light link.
//!
//! The nodes speak the same line protocol as the firmware over in-memory
//! streams, so a run against [`SimulatedTestbed`] goes through exactly the
//! same listener and reconstruction path as a run against real hardware.
//! All waiting uses tokio's clock; tests run on paused time.

use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::io;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, duplex,
    split,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::{debug, info, warn};
use vlc_lab_abstract::{EventKind, LinkConfig};

use crate::command::NodeCommand;

const STREAM_BUFFER: usize = 16 * 1024;
/// Time between the UDP send call and the start of the link transmission.
const LINK_SEND_DELAY: Duration = Duration::from_millis(1);
/// Time between link reception and delivery to the UDP socket.
const UDP_DELIVERY_DELAY: Duration = Duration::from_micros(500);
/// Stand-in for "never" when a configured delay does not fit the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay).unwrap_or_else(|| base + FAR_FUTURE)
}

#[derive(Debug)]
struct Frame {
    sequence_number: u64,
    arrival: Instant,
    /// Reaches the link layer but is lost before the UDP socket.
    udp_lost: bool,
    corrupted: bool,
}

struct LightLink {
    config: LinkConfig,
    rng: rand::rngs::StdRng,
    forced_drops: BTreeSet<u64>,
    frames: mpsc::UnboundedSender<Frame>,
    last_arrival: Option<Instant>,
}

impl LightLink {
    fn transmit(&mut self, sequence_number: u64) {
        if self.forced_drops.contains(&sequence_number) {
            debug!("Deterministically dropping frame {}", sequence_number);
            return;
        }
        if self.rng.random::<f64>() < self.config.link_loss_rate {
            debug!("Frame {} lost on the light link", sequence_number);
            return;
        }
        let udp_lost = self.rng.random::<f64>() < self.config.udp_loss_rate;
        let corrupted = self.rng.random::<f64>() < self.config.corrupt_rate;

        let low = self.config.min_latency_us.min(self.config.max_latency_us);
        let high = self.config.min_latency_us.max(self.config.max_latency_us);
        let latency = Duration::from_micros(self.rng.random_range(low..=high));

        // the light link delivers in order
        let mut arrival = after(Instant::now(), latency);
        if let Some(last) = self.last_arrival {
            arrival = arrival.max(last);
        }
        self.last_arrival = Some(arrival);

        let frame = Frame {
            sequence_number,
            arrival,
            udp_lost,
            corrupted,
        };
        if self.frames.send(frame).is_err() {
            debug!("Receiving node gone, frame {} discarded", sequence_number);
        }
    }
}

/// Emulated sending and receiving node for hardware-free runs.
pub struct SimulatedTestbed {
    link: LinkConfig,
    forced_drops: BTreeSet<u64>,
}

impl SimulatedTestbed {
    pub fn new(link: LinkConfig) -> Self {
        Self {
            link,
            forced_drops: BTreeSet::new(),
        }
    }

    /// Lose the frame of packet `sequence_number` on the link, whatever the
    /// loss rate.
    pub fn add_forced_drop(&mut self, sequence_number: u64) {
        self.forced_drops.insert(sequence_number);
    }

    /// Start both nodes. Returns the host ends of the sending and the
    /// receiving node's serial streams.
    pub fn spawn(self) -> (DuplexStream, DuplexStream) {
        let (sender_host, sender_node) = duplex(STREAM_BUFFER);
        let (receiver_host, receiver_node) = duplex(STREAM_BUFFER);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let link = LightLink {
            rng: rand::rngs::StdRng::seed_from_u64(self.link.seed),
            config: self.link,
            forced_drops: self.forced_drops,
            frames: frames_tx,
            last_arrival: None,
        };

        tokio::spawn(async move {
            if let Err(err) = sending_node(sender_node, link).await {
                warn!("Simulated sending node stopped: {}", err);
            }
        });
        tokio::spawn(async move {
            if let Err(err) = receiving_node(receiver_node, frames_rx).await {
                warn!("Simulated receiving node stopped: {}", err);
            }
        });

        (sender_host, receiver_host)
    }
}

type NodeLines = Lines<BufReader<ReadHalf<DuplexStream>>>;

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Next well-formed command from the host. Garbage is answered like the node
/// shell would.
async fn next_command<W: AsyncWrite + Unpin>(
    lines: &mut NodeLines,
    writer: &mut W,
) -> io::Result<Option<NodeCommand>> {
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<NodeCommand>() {
            Ok(command) => return Ok(Some(command)),
            Err(err) => write_line(writer, &format!("shell: {err}")).await?,
        }
    }
    Ok(None)
}

async fn sending_node(stream: DuplexStream, mut link: LightLink) -> io::Result<()> {
    let (reader, mut writer) = split(stream);
    let mut lines = BufReader::new(reader).lines();

    let (runtime_us, interval_us) = loop {
        match next_command(&mut lines, &mut writer).await? {
            Some(NodeCommand::LatencyClient {
                runtime_us,
                interval_us,
                ..
            }) => break (runtime_us, interval_us),
            Some(other) => write_line(&mut writer, &format!("shell: not a sender: {other}")).await?,
            None => return Ok(()),
        }
    };

    let interval_us = interval_us.max(1);
    let iterations = runtime_us.div_ceil(interval_us);
    info!(
        "Simulated sender: {} packets every {} us",
        iterations, interval_us
    );

    let start = Instant::now();
    for seq in 0..iterations {
        write_line(&mut writer, &format!("{} {seq}", EventKind::UdpSend.marker())).await?;
        sleep(LINK_SEND_DELAY).await;
        write_line(&mut writer, &format!("{} {seq}", EventKind::LinkSend.marker())).await?;
        link.transmit(seq);
        sleep_until(after(
            start,
            Duration::from_micros(interval_us.saturating_mul(seq + 1)),
        ))
        .await;
    }
    write_line(&mut writer, EventKind::SendFinished.marker()).await?;
    drop(link);

    // keep the port open until the host lets go of it
    while lines.next_line().await?.is_some() {}
    Ok(())
}

async fn receiving_node(
    stream: DuplexStream,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) -> io::Result<()> {
    let (reader, mut writer) = split(stream);
    let mut lines = BufReader::new(reader).lines();

    let (timeout_us, random_payload) = loop {
        match next_command(&mut lines, &mut writer).await? {
            Some(NodeCommand::LatencyServer {
                timeout_us,
                random_payload,
                ..
            }) => break (timeout_us, random_payload),
            Some(other) => {
                write_line(&mut writer, &format!("shell: not a receiver: {other}")).await?
            }
            None => return Ok(()),
        }
    };
    let idle = Duration::from_micros(timeout_us);
    write_line(&mut writer, EventKind::Ready.marker()).await?;

    // the node gives up once nothing arrived for `idle`
    let mut deadline = after(Instant::now(), idle);
    loop {
        let frame = match timeout_at(deadline, frames.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                // sender finished, nothing more in flight
                sleep_until(deadline).await;
                break;
            }
            Err(_) => break,
        };

        sleep_until(frame.arrival).await;
        let seq = frame.sequence_number;
        write_line(&mut writer, &format!("{} {seq}", EventKind::LinkReceive.marker())).await?;
        if !frame.udp_lost {
            sleep(UDP_DELIVERY_DELAY).await;
            if frame.corrupted && !random_payload {
                write_line(&mut writer, EventKind::Drop.marker()).await?;
            } else {
                write_line(&mut writer, &format!("{} {seq}", EventKind::UdpReceive.marker()))
                    .await?;
            }
        }
        deadline = after(Instant::now(), idle);
    }

    write_line(&mut writer, EventKind::Timeout.marker()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Host {
        lines: NodeLines,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Host {
        fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = split(stream);
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            write_line(&mut self.writer, line).await.unwrap();
        }

        async fn read(&mut self) -> String {
            self.lines.next_line().await.unwrap().unwrap()
        }

        async fn read_until(&mut self, last: &str) -> Vec<String> {
            let mut seen = Vec::new();
            loop {
                let line = self.read().await;
                let done = line == last;
                seen.push(line);
                if done {
                    return seen;
                }
            }
        }
    }

    fn lossless() -> LinkConfig {
        LinkConfig {
            min_latency_us: 30_000,
            max_latency_us: 30_000,
            ..Default::default()
        }
    }

    async fn start(testbed: SimulatedTestbed, random_payload: u8) -> (Host, Host) {
        let (sender, receiver) = testbed.spawn();
        let mut sender = Host::new(sender);
        let mut receiver = Host::new(receiver);
        receiver
            .send(&format!("udp_latency_server 200000 10 {random_payload}"))
            .await;
        assert_eq!(receiver.read().await, "rr");
        sender
            .send(&format!("udp_latency_client 300000 10 100000 {random_payload}"))
            .await;
        (sender, receiver)
    }

    #[tokio::test(start_paused = true)]
    async fn lossless_run_emits_every_marker() {
        let (mut sender, mut receiver) = start(SimulatedTestbed::new(lossless()), 1).await;

        assert_eq!(
            sender.read_until("fu").await,
            vec!["su 0", "sl 0", "su 1", "sl 1", "su 2", "sl 2", "fu"]
        );
        assert_eq!(
            receiver.read_until("Timeout").await,
            vec!["rl 0", "ru 0", "rl 1", "ru 1", "rl 2", "ru 2", "Timeout"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn link_latency_is_applied() {
        let (mut sender, mut receiver) = start(SimulatedTestbed::new(lossless()), 1).await;
        assert_eq!(sender.read().await, "su 0");
        assert_eq!(sender.read().await, "sl 0");
        let sent = Instant::now();
        assert_eq!(receiver.read().await, "rl 0");
        let latency = sent.elapsed();
        assert!(latency >= Duration::from_millis(30) && latency <= Duration::from_millis(31));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_payloads_are_dropped_when_checked() {
        let mut testbed = SimulatedTestbed::new(LinkConfig {
            corrupt_rate: 1.0,
            ..lossless()
        });
        testbed.add_forced_drop(1);
        let (_sender, mut receiver) = start(testbed, 0).await;

        assert_eq!(
            receiver.read_until("Timeout").await,
            vec!["rl 0", "du", "rl 2", "du", "Timeout"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn udp_loss_keeps_link_reception() {
        let testbed = SimulatedTestbed::new(LinkConfig {
            udp_loss_rate: 1.0,
            ..lossless()
        });
        let (_sender, mut receiver) = start(testbed, 1).await;
        assert_eq!(
            receiver.read_until("Timeout").await,
            vec!["rl 0", "rl 1", "rl 2", "Timeout"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dead_link_only_times_out() {
        let testbed = SimulatedTestbed::new(LinkConfig {
            link_loss_rate: 1.0,
            ..lossless()
        });
        let (mut sender, mut receiver) = start(testbed, 1).await;
        assert_eq!(sender.read_until("fu").await.len(), 7);
        assert_eq!(receiver.read().await, "Timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn huge_delays_do_not_overflow_the_clock() {
        let now = Instant::now();
        assert_eq!(after(now, Duration::MAX), now + FAR_FUTURE);
        assert_eq!(after(now, Duration::from_secs(2)), now + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_commands_get_a_shell_reply() {
        let (sender, _receiver) = SimulatedTestbed::new(lossless()).spawn();
        let mut sender = Host::new(sender);
        sender.send("reboot").await;
        assert_eq!(sender.read().await, "shell: unknown command 'reboot'");
        sender.send("udp_latency_server 1 1 1").await;
        assert!(sender.read().await.starts_with("shell: not a sender"));
    }
}
