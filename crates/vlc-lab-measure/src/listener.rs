//! Serial stream listeners, one per node.
//!
//! A listener owns one node's stream exclusively: it writes the node's start
//! command, then turns every incoming line into a typed event and files packet
//! events into its own [`EventTable`]. The table is handed out only when the
//! listener reaches a terminal status, so no locking is needed while
//! collecting.

use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf, split,
};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};
use vlc_lab_abstract::{EventKind, RawEvent, Role, Timestamp};

use crate::parse::{LineError, parse_line};
use crate::table::EventTable;

/// Why a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerStatus {
    /// Stopped because the run was over (the peer listener finished).
    Completed,
    /// The stream went silent, ended, or the node reported a timeout.
    TimedOut,
    /// The stream failed, or the run could not be started.
    Aborted,
}

/// Bookkeeping of one listener, returned with its event table.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerSummary {
    pub role: Role,
    pub port: String,
    pub status: ListenerStatus,
    pub lines_read: u64,
    pub events_stored: u64,
    /// Lines that could not be parsed or arrived on the wrong stream.
    pub anomalies: u64,
    pub duplicates: u64,
    /// `du` markers: payloads the receiver rejected.
    pub drop_count: u64,
    pub ready_seen: bool,
    pub send_finished: bool,
}

impl ListenerSummary {
    fn new(role: Role, port: String) -> Self {
        Self {
            role,
            port,
            status: ListenerStatus::Aborted,
            lines_read: 0,
            events_stored: 0,
            anomalies: 0,
            duplicates: 0,
            drop_count: 0,
            ready_seen: false,
            send_finished: false,
        }
    }
}

/// Everything a listener hands back once it has stopped.
#[derive(Debug, Clone)]
pub struct ListenerOutput {
    pub summary: ListenerSummary,
    pub table: EventTable,
}

enum ReadOutcome {
    Line(String, Timestamp),
    EndOfStream,
    TimedOut,
    Failed(io::Error),
}

pub struct Listener<S> {
    role: Role,
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    epoch: Instant,
    read_timeout: Duration,
    table: EventTable,
    summary: ListenerSummary,
}

impl<S> Listener<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// `epoch` must be shared by both listeners of a run so their
    /// timestamps are comparable.
    pub fn new(
        role: Role,
        port: impl Into<String>,
        stream: S,
        epoch: Instant,
        read_timeout: Duration,
    ) -> Self {
        let (reader, writer) = split(stream);
        Self {
            role,
            reader: BufReader::new(reader),
            writer,
            epoch,
            read_timeout,
            table: EventTable::new(),
            summary: ListenerSummary::new(role, port.into()),
        }
    }

    /// Receiving node: issue the setup command, open the start gate on `rr`,
    /// collect receive events until the stream times out. `done` is raised on
    /// exit whatever the outcome.
    pub async fn run_receiver(
        mut self,
        command: String,
        ready: oneshot::Sender<()>,
        done: watch::Sender<bool>,
    ) -> ListenerOutput {
        let mut gate = Some(ready);
        let status = match self.send_command(&command).await {
            Ok(()) => {
                info!("Waiting for receiver readiness on {}", self.summary.port);
                self.receive_loop(&mut gate).await
            }
            Err(err) => {
                error!("[{}] cannot write setup command: {}", self.role, err);
                ListenerStatus::Aborted
            }
        };
        if gate.is_some() {
            warn!("[{}] stopped before reporting readiness", self.role);
        }
        // dropping an unopened gate releases the sender without a start command
        drop(gate);
        done.send_replace(true);
        self.finish(status)
    }

    /// Sending node: wait for the start gate, issue the start command, collect
    /// send events until the stream times out or the receiver has finished.
    pub async fn run_sender(
        mut self,
        command: String,
        ready: oneshot::Receiver<()>,
        peer_done: watch::Receiver<bool>,
    ) -> ListenerOutput {
        if ready.await.is_err() {
            warn!("[{}] receiver never became ready, start command not sent", self.role);
            return self.finish(ListenerStatus::Aborted);
        }
        if let Err(err) = self.send_command(&command).await {
            error!("[{}] cannot write start command: {}", self.role, err);
            return self.finish(ListenerStatus::Aborted);
        }
        let status = self.send_loop(&peer_done).await;
        self.finish(status)
    }

    async fn receive_loop(&mut self, gate: &mut Option<oneshot::Sender<()>>) -> ListenerStatus {
        loop {
            let event = match self.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(status) => return status,
            };

            match event.kind {
                EventKind::Ready => match gate.take() {
                    Some(sender_gate) => {
                        self.summary.ready_seen = true;
                        info!("[{}] ready, releasing sender", self.role);
                        if sender_gate.send(()).is_err() {
                            warn!("[{}] sender listener is gone", self.role);
                        }
                    }
                    None => warn!("[{}] readiness reported twice, ignoring", self.role),
                },
                EventKind::Timeout => {
                    info!("[{}] node reported timeout", self.role);
                    return ListenerStatus::TimedOut;
                }
                EventKind::Drop => {
                    self.summary.drop_count += 1;
                    debug!("[{}] payload mismatch, packet dropped", self.role);
                }
                _ => self.store(&event),
            }
        }
    }

    async fn send_loop(&mut self, peer_done: &watch::Receiver<bool>) -> ListenerStatus {
        while !*peer_done.borrow() {
            let event = match self.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(status) => return status,
            };

            if event.kind == EventKind::SendFinished {
                self.summary.send_finished = true;
                info!("[{}] node finished sending", self.role);
            } else {
                self.store(&event);
            }
        }
        ListenerStatus::Completed
    }

    /// Next well-formed event for this stream. `Ok(None)` means the line was
    /// skipped, `Err` carries the terminal status.
    async fn next_event(&mut self) -> Result<Option<RawEvent>, ListenerStatus> {
        match self.next_line().await {
            ReadOutcome::Line(line, at) => Ok(self.parse(&line, at)),
            ReadOutcome::EndOfStream => {
                info!("[{}] stream closed", self.role);
                Err(ListenerStatus::TimedOut)
            }
            ReadOutcome::TimedOut => {
                info!(
                    "[{}] serial timeout after {:?} without input",
                    self.role, self.read_timeout
                );
                Err(ListenerStatus::TimedOut)
            }
            ReadOutcome::Failed(err) => {
                error!("[{}] serial read failed: {}", self.role, err);
                Err(ListenerStatus::Aborted)
            }
        }
    }

    async fn send_command(&mut self, command: &str) -> io::Result<()> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        info!("Send: {} to {}", command, self.summary.port);
        Ok(())
    }

    async fn next_line(&mut self) -> ReadOutcome {
        let mut buf = Vec::new();
        match timeout(self.read_timeout, self.reader.read_until(b'\n', &mut buf)).await {
            Err(_) => ReadOutcome::TimedOut,
            Ok(Err(err)) => ReadOutcome::Failed(err),
            Ok(Ok(0)) => ReadOutcome::EndOfStream,
            Ok(Ok(_)) => {
                let at = Timestamp::from_duration(self.epoch.elapsed());
                self.summary.lines_read += 1;
                let line = String::from_utf8_lossy(&buf).into_owned();
                ReadOutcome::Line(line, at)
            }
        }
    }

    fn parse(&mut self, line: &str, at: Timestamp) -> Option<RawEvent> {
        debug!(
            "[{}] {:.6} - {}",
            self.summary.port,
            at.as_secs_f64(),
            line.trim_end()
        );

        let event = match parse_line(line, at) {
            Ok(event) => event,
            Err(LineError::Empty) => return None,
            Err(err) => {
                warn!("[{}] cannot parse line: {}", self.role, err);
                self.summary.anomalies += 1;
                return None;
            }
        };

        if event.kind.role() != self.role {
            warn!(
                "[{}] marker '{}' belongs to the {} stream, skipping",
                self.role,
                event.kind,
                event.kind.role()
            );
            self.summary.anomalies += 1;
            return None;
        }
        Some(event)
    }

    fn store(&mut self, event: &RawEvent) {
        match self.table.record(event) {
            Ok(true) => self.summary.events_stored += 1,
            Ok(false) => {}
            Err(duplicate) => {
                warn!("[{}] {}", self.role, duplicate);
                self.summary.duplicates += 1;
            }
        }
    }

    fn finish(mut self, status: ListenerStatus) -> ListenerOutput {
        self.summary.status = status;
        info!(
            "[{}] listener stopped ({:?}): {} lines, {} events, {} anomalies, {} duplicates",
            self.role,
            status,
            self.summary.lines_read,
            self.summary.events_stored,
            self.summary.anomalies,
            self.summary.duplicates
        );
        ListenerOutput {
            summary: self.summary,
            table: self.table,
        }
    }
}
