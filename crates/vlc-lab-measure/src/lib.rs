//! Measurement engine of the VLC testbed host.
//!
//! Two [`listener::Listener`] tasks collect the serial output of the sending
//! and the receiving node, the [`coordinator::RunCoordinator`] sequences them
//! and merges their event tables into per-packet records, which
//! [`stats`] and [`codec`] consume.

pub mod codec;
pub mod command;
pub mod coordinator;
pub mod listener;
pub mod parse;
pub mod reconstruct;
pub mod report;
pub mod simulated;
pub mod stats;
pub mod table;

pub use codec::CodecError;
pub use command::NodeCommand;
pub use coordinator::{Endpoint, Measurement, MeasurementError, RunCoordinator};
pub use listener::{ListenerStatus, ListenerSummary};
pub use reconstruct::{MissingAnchor, reconstruct, reconstruct_run};
pub use report::{LayerReport, ReportOptions, RunReport};
pub use simulated::SimulatedTestbed;
pub use stats::StatsError;
pub use table::EventTable;
