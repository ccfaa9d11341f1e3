pub mod config;
pub mod event;
pub mod profile;
pub mod record;

pub use config::{Layer, LinkConfig, OverheadModel, RunConfig, TimeoutPolicy};
pub use event::{EventKind, RawEvent, Role, Timestamp};
pub use record::{
    InvalidRecord, PacketRecord, PacketTimings, RunResult, ValidityReport, Violation,
};

pub use profile::{
    LinkOverride, OutputProfile, RunOverride, RunProfile, SerialProfile, TimeoutOverride,
};
