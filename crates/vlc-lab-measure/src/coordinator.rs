use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{error, info};
use vlc_lab_abstract::{Role, RunConfig, RunResult, TimeoutPolicy, ValidityReport};

use crate::command::NodeCommand;
use crate::listener::{Listener, ListenerStatus, ListenerSummary};
use crate::reconstruct::{MissingAnchor, reconstruct_run};

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("no measurement possible (sender {sender:?}, receiver {receiver:?})")]
    MissingAnchor {
        sender: ListenerStatus,
        receiver: ListenerStatus,
        #[source]
        source: MissingAnchor,
    },
    #[error("{role} listener task failed")]
    ListenerTask {
        role: Role,
        #[source]
        source: JoinError,
    },
}

/// Serial stream of one node plus a label for logs (usually the port path).
pub struct Endpoint<S> {
    pub label: String,
    pub stream: S,
}

impl<S> Endpoint<S> {
    pub fn new(label: impl Into<String>, stream: S) -> Self {
        Self {
            label: label.into(),
            stream,
        }
    }
}

/// Outcome of a run that produced records. Invalid or missing packets are
/// reported through `validity` and the listener summaries.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub result: RunResult,
    pub sender: ListenerSummary,
    pub receiver: ListenerSummary,
    pub validity: ValidityReport,
}

pub struct RunCoordinator {
    config: RunConfig,
    timeouts: TimeoutPolicy,
}

impl RunCoordinator {
    pub fn new(config: RunConfig, timeouts: TimeoutPolicy) -> Self {
        Self { config, timeouts }
    }

    /// Run one measurement over the two node streams.
    ///
    /// The receiving node is set up first; the sending node only gets its
    /// start command once the receiver reported readiness. Both listeners
    /// then run until they stop on their own, and their tables are merged
    /// after both have been joined.
    pub async fn run<S, R>(
        &self,
        sender: Endpoint<S>,
        receiver: Endpoint<R>,
    ) -> Result<Measurement, MeasurementError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let receiver_timeout = self.timeouts.receiver_timeout(&self.config);
        let sender_timeout = self.timeouts.sender_read_timeout(&self.config);
        let server = NodeCommand::server(&self.config, receiver_timeout).to_string();
        let client = NodeCommand::client(&self.config).to_string();

        info!(
            "Starting run: {} s, {} byte every {} us (receiver timeout {:?}, sender timeout {:?})",
            self.config.runtime_s(),
            self.config.payload_size_bytes,
            self.config.interval_us,
            receiver_timeout,
            sender_timeout
        );

        let epoch = Instant::now();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        let receiver_listener = Listener::new(
            Role::Receiver,
            receiver.label,
            receiver.stream,
            epoch,
            receiver_timeout,
        );
        let sender_listener = Listener::new(
            Role::Sender,
            sender.label,
            sender.stream,
            epoch,
            sender_timeout,
        );

        let receiver_task = tokio::spawn(receiver_listener.run_receiver(server, ready_tx, done_tx));
        let sender_task = tokio::spawn(sender_listener.run_sender(client, ready_rx, done_rx));
        let (sender_output, receiver_output) = tokio::join!(sender_task, receiver_task);

        let sender_output = sender_output.map_err(|source| MeasurementError::ListenerTask {
            role: Role::Sender,
            source,
        })?;
        let receiver_output = receiver_output.map_err(|source| MeasurementError::ListenerTask {
            role: Role::Receiver,
            source,
        })?;

        let result = match reconstruct_run(
            self.config.clone(),
            &sender_output.table,
            &receiver_output.table,
        ) {
            Ok(result) => result,
            Err(source) => {
                error!("Measurement failed: {}", source);
                return Err(MeasurementError::MissingAnchor {
                    sender: sender_output.summary.status,
                    receiver: receiver_output.summary.status,
                    source,
                });
            }
        };

        let validity = result.validity_report();
        info!(
            "Run finished: {} packets, {} invalid",
            result.len(),
            validity.invalid_count()
        );

        Ok(Measurement {
            result,
            sender: sender_output.summary,
            receiver: receiver_output.summary,
            validity,
        })
    }
}
